//! Unified error handling for nvtune
//!
//! This crate provides a single error type used across all nvtune components.
//! It uses thiserror for ergonomic error definitions with proper Display and
//! Error trait impls.

use std::io;
use std::path::PathBuf;

/// Result type alias using NvtuneError
pub type Result<T> = std::result::Result<T, NvtuneError>;

/// Unified error type for all nvtune operations
#[derive(thiserror::Error, Debug)]
pub enum NvtuneError {
    // ============================================================================
    // Device Errors
    // ============================================================================
    #[error("GPU unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("GPU error: {0}")]
    DeviceError(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("GPU temperature too high ({temperature}°C >= {critical}°C); refusing clock offset write until the GPU cools down")]
    ThermalGuardTripped { temperature: u32, critical: u32 },

    // ============================================================================
    // Elevation and IPC Errors
    // ============================================================================
    #[error("Authentication cancelled")]
    ElevationCancelled,

    #[error("Elevated helper timed out after {seconds}s")]
    ElevationTimeout { seconds: u64 },

    #[error("Helper protocol error: {0}")]
    ProtocolError(String),

    #[error("{0}")]
    HelperFailed(String),

    // ============================================================================
    // Orchestration Errors
    // ============================================================================
    #[error("Profile apply failed at step '{step}': {message} (earlier steps were not rolled back)")]
    PartialApplyFailure { step: String, message: String },

    // ============================================================================
    // Profile and Configuration Errors
    // ============================================================================
    #[error("Profile not found: {0}")]
    ProfileNotFound(String),

    #[error("Profile already exists: {0}")]
    ProfileExists(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // ============================================================================
    // I/O and Serialization Errors
    // ============================================================================
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead { path: PathBuf, source: io::Error },

    #[error("Failed to write file {path}: {source}")]
    FileWrite { path: PathBuf, source: io::Error },

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    // ============================================================================
    // Generic Errors
    // ============================================================================
    #[error("{0}")]
    Generic(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),
}

impl NvtuneError {
    /// Create a generic error from a string
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }

    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a device error from a string
    pub fn device(msg: impl Into<String>) -> Self {
        Self::DeviceError(msg.into())
    }

    /// Create a partial-apply error naming the failed step
    pub fn partial_apply(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PartialApplyFailure {
            step: step.into(),
            message: message.into(),
        }
    }

    /// Whether the caller may retry after re-elevating or waiting
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied(_)
                | Self::ThermalGuardTripped { .. }
                | Self::ElevationCancelled
                | Self::ElevationTimeout { .. }
        )
    }
}

// Allow converting from String to NvtuneError
impl From<String> for NvtuneError {
    fn from(s: String) -> Self {
        Self::Generic(s)
    }
}

// Allow converting from &str to NvtuneError
impl From<&str> for NvtuneError {
    fn from(s: &str) -> Self {
        Self::Generic(s.to_string())
    }
}
