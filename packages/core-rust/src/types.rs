//! Lifecycle states and the "no serve duty" sentinel.

/// Lifecycle state of a registered module.
///
/// State machine: Registered -> Initialized -> Serving -> `ShuttingDown` -> Finalized.
/// A module whose `initialize` fails moves to `Failed` and is never finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    /// Accepted by the registry, not yet initialized.
    Registered,
    /// `initialize` succeeded.
    Initialized,
    /// `initialize` returned an error.
    Failed,
    /// The module's serve task has been launched.
    Serving,
    /// `shutdown` has been delivered to the module.
    ShuttingDown,
    /// `finalize` has been delivered to the module.
    Finalized,
}

impl ModuleState {
    /// Returns the lowercase name of the state, for logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::Initialized => "initialized",
            Self::Failed => "failed",
            Self::Serving => "serving",
            Self::ShuttingDown => "shutting_down",
            Self::Finalized => "finalized",
        }
    }

    /// Whether the module holds initialized resources that `finalize` must release.
    #[must_use]
    pub fn needs_finalize(self) -> bool {
        matches!(self, Self::Initialized | Self::Serving | Self::ShuttingDown)
    }
}

/// Returned from `Module::serve` by modules that have no long-running duty.
///
/// The registry treats it as a silent, successful exit.
#[derive(Debug, Clone, Copy, Default, thiserror::Error)]
#[error("not implemented")]
pub struct NotImplemented;

/// Checks whether a serve error is the [`NotImplemented`] sentinel.
#[must_use]
pub fn is_not_implemented(err: &anyhow::Error) -> bool {
    err.downcast_ref::<NotImplemented>().is_some()
}
