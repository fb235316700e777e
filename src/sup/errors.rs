use thiserror::Error;

/// Errors that can occur in the supervisor core
#[derive(Error, Debug)]
pub enum SupError {
    /// Service identity is unknown
    #[error("service {name:?} unknown")]
    UnknownService { name: String },

    /// Two definitions in one configuration set share an identity
    #[error("duplicate service identity {name:?} in configuration")]
    DuplicateIdentity { name: String },

    /// Service is running and the operation needs it stopped
    #[error("service {name:?} is up")]
    ServiceIsUp { name: String },

    /// Service has no process to deliver anything to
    #[error("service {name:?} is down")]
    ServiceIsDown { name: String },

    /// Condition name failed validation
    #[error("invalid condition name {name:?}")]
    InvalidCondition { name: String },

    /// Signal number outside the valid range
    #[error("invalid signal {signo}")]
    InvalidSignal { signo: i32 },

    /// A reload or runlevel change is still tearing services down
    #[error("teardown in progress, try again later")]
    TeardownInProgress,

    /// Runlevel outside 0..=9
    #[error("invalid runlevel {level}")]
    InvalidRunlevel { level: u32 },

    /// The supervisor is on its way down
    #[error("shutting down")]
    ShuttingDown,
}

impl SupError {
    pub fn unknown_service<S: Into<String>>(name: S) -> Self {
        SupError::UnknownService { name: name.into() }
    }

    pub fn duplicate_identity<S: Into<String>>(name: S) -> Self {
        SupError::DuplicateIdentity { name: name.into() }
    }

    pub fn service_is_up<S: Into<String>>(name: S) -> Self {
        SupError::ServiceIsUp { name: name.into() }
    }

    pub fn service_is_down<S: Into<String>>(name: S) -> Self {
        SupError::ServiceIsDown { name: name.into() }
    }

    pub fn invalid_condition<S: Into<String>>(name: S) -> Self {
        SupError::InvalidCondition { name: name.into() }
    }
}
