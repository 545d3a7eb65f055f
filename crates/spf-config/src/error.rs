//! Error types for configuration operations.

use std::path::PathBuf;

use spf_core::SpfError;
use thiserror::Error;

/// Errors that can occur while reading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read a file
    #[error("failed to read file '{path}': {source}")]
    ReadFile {
        /// Path of the file that could not be read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to write a file
    #[error("failed to write file '{path}': {source}")]
    WriteFile {
        /// Path of the file that could not be written.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// Failed to serialize TOML
    #[error("failed to serialize TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// The property chain ended before a header or payload it announced
    #[error("config truncated at offset {offset}: need {needed} bytes, have {available}")]
    Truncated {
        /// Byte offset of the incomplete item.
        offset: usize,
        /// Bytes the item needs.
        needed: usize,
        /// Bytes left in the buffer.
        available: usize,
    },

    /// A property payload is smaller than its typed layout
    #[error("property 0x{prop_id:08X} too small: {size} bytes, need {needed}")]
    PropertyTooSmall {
        /// Property id.
        prop_id: u32,
        /// Declared payload size.
        size: u32,
        /// Minimum payload size.
        needed: u32,
    },

    /// A property carries a value the container cannot accept
    #[error("property 0x{prop_id:08X} has invalid value {value}")]
    InvalidProperty {
        /// Property id.
        prop_id: u32,
        /// Offending value.
        value: u32,
    },

    /// A value reapplied onto a container differs from the one it already has
    #[error("{field} mismatch: container has {current}, config gives {given}")]
    Mismatch {
        /// Name of the field.
        field: &'static str,
        /// Value already on the container.
        current: u32,
        /// Value in the config.
        given: u32,
    },

    /// A graph description names a module that does not exist
    #[error("unknown module instance 0x{0:X}")]
    UnknownModule(u32),

    /// A graph description names a subgraph that does not exist
    #[error("unknown subgraph 0x{0:X}")]
    UnknownSubgraph(u32),

    /// A graph description names a port its module does not have
    #[error("module 0x{module:X} has no {side} port {port}")]
    UnknownPort {
        /// Module instance id.
        module: u32,
        /// "input" or "output".
        side: &'static str,
        /// Port id.
        port: u32,
    },

    /// Two entries of a graph description share an id
    #[error("duplicate id 0x{0:X}")]
    Duplicate(u32),
}

impl ConfigError {
    /// Create a read file error.
    pub fn read_file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ConfigError::ReadFile {
            path: path.into(),
            source,
        }
    }

    /// Create a write file error.
    pub fn write_file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ConfigError::WriteFile {
            path: path.into(),
            source,
        }
    }

    /// Create a truncation error.
    pub fn truncated(offset: usize, needed: usize, available: usize) -> Self {
        ConfigError::Truncated {
            offset,
            needed,
            available,
        }
    }
}

impl From<ConfigError> for SpfError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::ReadFile { .. } | ConfigError::WriteFile { .. } => SpfError::Failed,
            ConfigError::TomlSerialize(_) => SpfError::Failed,
            _ => SpfError::BadParam,
        }
    }
}
