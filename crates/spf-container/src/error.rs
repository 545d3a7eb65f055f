//! Error types for container operations.

use spf_config::ConfigError;
use spf_core::SpfError;
use thiserror::Error;

/// Errors raised by the container control plane.
#[derive(Debug, Error)]
pub enum CuError {
    /// A topology or module operation failed
    #[error(transparent)]
    Spf(#[from] SpfError),

    /// The container configuration could not be applied
    #[error("container config: {0}")]
    Config(#[from] ConfigError),

    /// The worker thread could not be spawned
    #[error("failed to spawn container thread '{name}': {source}")]
    Spawn {
        /// Thread name.
        name: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Disconnect requested while either side of an external link is started
    #[error("disconnect of started port {port_id} on module 0x{miid:X}")]
    DisconnectStarted {
        /// Module instance id of the port.
        miid: u32,
        /// Port id.
        port_id: u32,
    },

    /// The container thread is gone
    #[error("container 0x{0:X} is not running")]
    NotRunning(u32),
}

impl CuError {
    /// Result code this error is acknowledged with.
    pub fn to_spf(&self) -> SpfError {
        match self {
            CuError::Spf(e) => *e,
            CuError::Config(
                ConfigError::ReadFile { .. }
                | ConfigError::WriteFile { .. }
                | ConfigError::TomlSerialize(_),
            ) => SpfError::Failed,
            CuError::Config(_) => SpfError::BadParam,
            CuError::Spawn { .. } | CuError::DisconnectStarted { .. } => SpfError::Failed,
            CuError::NotRunning(_) => SpfError::NotReady,
        }
    }

    /// Numeric ack result code.
    pub fn code(&self) -> u32 {
        self.to_spf().code()
    }
}

impl From<CuError> for SpfError {
    fn from(err: CuError) -> Self {
        err.to_spf()
    }
}

/// Result alias for container operations.
pub type CuResult<T> = Result<T, CuError>;
