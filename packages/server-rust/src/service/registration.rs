//! Service registration entries.

use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

use tonic::body::Body;
use tonic::server::NamedService;
use tonic::service::RoutesBuilder;
use tonic::transport::Channel;
use tower::Service;

use super::interceptor::{Intercepted, Interception};
use super::matcher::Matcher;
use crate::network::gateway::GatewayMux;

// ---------------------------------------------------------------------------
// Descriptors
// ---------------------------------------------------------------------------

/// One RPC method of a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub name: String,
    pub client_streaming: bool,
    pub server_streaming: bool,
}

/// Method table of an RPC service.
///
/// Identifies the service by its fully qualified name and tells the
/// interceptor chain which methods are unary and which stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub name: String,
    pub methods: Vec<MethodDescriptor>,
}

impl ServiceDescriptor {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
        }
    }

    #[must_use]
    pub fn method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.iter().find(|m| m.name == name)
    }

    #[must_use]
    pub fn unary(self, name: &str) -> Self {
        self.with_method(name, false, false)
    }

    #[must_use]
    pub fn client_streaming(self, name: &str) -> Self {
        self.with_method(name, true, false)
    }

    #[must_use]
    pub fn server_streaming(self, name: &str) -> Self {
        self.with_method(name, false, true)
    }

    #[must_use]
    pub fn bidi_streaming(self, name: &str) -> Self {
        self.with_method(name, true, true)
    }

    fn with_method(mut self, name: &str, client_streaming: bool, server_streaming: bool) -> Self {
        self.methods.push(MethodDescriptor {
            name: name.to_string(),
            client_streaming,
            server_streaming,
        });
        self
    }

    /// Descriptor of the standard `grpc.health.v1.Health` service.
    #[must_use]
    pub fn health() -> Self {
        Self::new("grpc.health.v1.Health")
            .unary("Check")
            .server_streaming("Watch")
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Rejected service registration.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("service descriptor has no name")]
    MissingName,
    #[error("service descriptor {0} has no methods")]
    NoMethods(String),
    #[error("descriptor names {descriptor} but the implementation serves {implementation}")]
    NameMismatch {
        descriptor: String,
        implementation: &'static str,
    },
    #[error("service {0} registered twice")]
    Duplicate(String),
}

// ---------------------------------------------------------------------------
// Gateway registration
// ---------------------------------------------------------------------------

/// Registers a service's HTTP/JSON routes against the loopback RPC channel.
pub type GatewayRegisterFn =
    Arc<dyn Fn(&mut GatewayMux, Channel) -> anyhow::Result<()> + Send + Sync>;

/// Gateway half of a registration: the route callback plus the matchers
/// that send plain HTTP requests to the gateway.
#[derive(Clone)]
pub struct GatewayRegistration {
    pub register: GatewayRegisterFn,
    pub matchers: Vec<Matcher>,
}

impl fmt::Debug for GatewayRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayRegistration")
            .field("matchers", &self.matchers)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// ServiceEntry
// ---------------------------------------------------------------------------

type AddRoute = Arc<dyn Fn(&mut RoutesBuilder) + Send + Sync>;

/// A validated descriptor/implementation pair, optionally gateway-enabled.
#[derive(Clone)]
pub struct ServiceEntry {
    descriptor: Arc<ServiceDescriptor>,
    interception: Interception,
    add_route: AddRoute,
    gateway: Option<GatewayRegistration>,
}

impl ServiceEntry {
    /// Pairs a descriptor with its implementation.
    ///
    /// # Errors
    ///
    /// Fails if the descriptor is unnamed, has no methods, or names a
    /// different service than the implementation.
    pub fn new<S>(descriptor: ServiceDescriptor, service: S) -> Result<Self, RegistrationError>
    where
        S: Service<http::Request<Body>, Response = http::Response<Body>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        Self::intercepted(descriptor, service, Interception::Plain)
    }

    /// Like [`new`](Self::new), declaring the implementation's interception
    /// capability.
    ///
    /// # Errors
    ///
    /// Same as [`new`](Self::new).
    pub fn intercepted<S>(
        descriptor: ServiceDescriptor,
        service: S,
        interception: Interception,
    ) -> Result<Self, RegistrationError>
    where
        S: Service<http::Request<Body>, Response = http::Response<Body>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        if descriptor.name.is_empty() {
            return Err(RegistrationError::MissingName);
        }
        if descriptor.methods.is_empty() {
            return Err(RegistrationError::NoMethods(descriptor.name));
        }
        if descriptor.name != S::NAME {
            return Err(RegistrationError::NameMismatch {
                descriptor: descriptor.name,
                implementation: S::NAME,
            });
        }

        let descriptor = Arc::new(descriptor);
        let wrapped = Intercepted::new(service, Arc::clone(&descriptor), interception.clone());
        let add_route: AddRoute = Arc::new(move |routes: &mut RoutesBuilder| {
            routes.add_service(wrapped.clone());
        });

        Ok(Self {
            descriptor,
            interception,
            add_route,
            gateway: None,
        })
    }

    /// Attaches a gateway callback and its request matchers.
    #[must_use]
    pub fn with_gateway(mut self, register: GatewayRegisterFn, matchers: Vec<Matcher>) -> Self {
        self.gateway = Some(GatewayRegistration { register, matchers });
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    #[must_use]
    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub fn interception(&self) -> &Interception {
        &self.interception
    }

    #[must_use]
    pub fn gateway(&self) -> Option<&GatewayRegistration> {
        self.gateway.as_ref()
    }

    /// Mounts the (intercepted) service on an RPC route table.
    pub fn add_to(&self, routes: &mut RoutesBuilder) {
        (self.add_route)(routes);
    }
}

impl fmt::Debug for ServiceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceEntry")
            .field("service", &self.descriptor.name)
            .field("interception", &self.interception)
            .field("gateway", &self.gateway)
            .finish_non_exhaustive()
    }
}
