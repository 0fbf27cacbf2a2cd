use async_trait::async_trait;
use serde_json::Value;

use crate::types::NotImplemented;

/// A named, prioritized lifecycle participant managed by a `ModuleRegistry`.
///
/// Every hook takes `&self` because `serve` and `shutdown` run concurrently
/// on the same instance; implementations keep mutable state behind their own
/// locks. The default hooks describe a module with nothing to do, so a module
/// only overrides the phases it cares about.
#[async_trait]
pub trait Module: Send + Sync + 'static {
    /// Unique name of the module. Also the key of its configuration section.
    fn name(&self) -> &str;

    /// Initialization priority. Lower values initialize first.
    fn priority(&self) -> i32 {
        0
    }

    /// Initialize with the module's own configuration section, if present.
    async fn initialize(&self, _config: Option<&Value>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Run the module's long-running duty until it is shut down.
    ///
    /// Returning [`NotImplemented`] means the module has no such duty.
    async fn serve(&self) -> anyhow::Result<()> {
        Err(NotImplemented.into())
    }

    /// Ask the module to stop serving. Must return promptly.
    async fn shutdown(&self) {}

    /// Release resources acquired during `initialize`.
    async fn finalize(&self) {}
}
