use thiserror::Error;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Service registry error: {0}")]
    RegistryError(String),

    #[error("Cannot bind {0}: {1}")]
    BindError(String, String),

    #[error("TLS material error: {0}")]
    TlsError(String),
}

impl StartupError {
    /// Process exit code for this failure class.
    pub fn exit_code(&self) -> i32 {
        match self {
            StartupError::ConfigError(_) | StartupError::RegistryError(_) => 2,
            StartupError::BindError(..) => 3,
            StartupError::TlsError(_) => 4,
        }
    }
}
