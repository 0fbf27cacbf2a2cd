//! RPC service registration, request matching and call interception.
//!
//! 1. **Matching** (`matcher`): predicates over request metadata
//! 2. **Registration** (`registration`): descriptor/implementation pairs,
//!    optionally carrying a gateway callback
//! 3. **Interception** (`interceptor`): per-service unary and streaming hooks

pub mod interceptor;
pub mod matcher;
pub mod registration;

pub use interceptor::{
    status_response, CallInfo, Intercepted, Interception, Next, StreamInterceptor,
    UnaryInterceptor,
};
pub use matcher::{Matcher, RequestHead, GATEWAY_CONTENT_TYPE, GRPC_CONTENT_TYPE};
pub use registration::{
    GatewayRegisterFn, GatewayRegistration, MethodDescriptor, RegistrationError,
    ServiceDescriptor, ServiceEntry,
};
