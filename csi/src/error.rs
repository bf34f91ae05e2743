//! Two-tier error model for the storage engine and the RPC façade.
//!
//! `EngineError` is the low-level error produced by the image controller
//! and mount manager: host-tool failures, syscall failures, missing
//! volumes. `CsiError` wraps an `EngineError` (or is raised directly by a
//! handler) with the RPC-visible classification and converts to a
//! `tonic::Status` at the boundary, the same role `DeviceError` /
//! `FreezeFsError` play for attach/detach and nodeplugin_svc.

use snafu::Snafu;
use std::fmt;
use std::string::FromUtf8Error;
use tonic::{Code, Status};

/// Error raised by the image controller / mount manager while performing
/// a single operation. Carries the operation label and the underlying
/// cause.
pub struct EngineError {
    pub op: &'static str,
    pub message: String,
}

impl EngineError {
    pub fn new(op: &'static str, message: impl Into<String>) -> Self {
        Self {
            op,
            message: message.into(),
        }
    }

    /// A required host executable could not be found on `PATH`.
    pub fn missing_tool(op: &'static str, tool: &str) -> Self {
        Self::new(op, format!("required executable not found on PATH: {}", tool))
    }
}

impl fmt::Debug for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.op, self.message)
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.op, self.message)
    }
}

impl std::error::Error for EngineError {
    fn description(&self) -> &str {
        &self.message
    }
}

impl From<std::io::Error> for EngineError {
    fn from(error: std::io::Error) -> EngineError {
        EngineError::new("io", format!("{}", error))
    }
}

impl From<FromUtf8Error> for EngineError {
    fn from(error: FromUtf8Error) -> EngineError {
        EngineError::new("io", format!("{}", error))
    }
}

impl From<serde_json::error::Error> for EngineError {
    fn from(error: serde_json::error::Error) -> EngineError {
        EngineError::new("parse", format!("{}", error))
    }
}

impl From<nix::Error> for EngineError {
    fn from(error: nix::Error) -> EngineError {
        EngineError::new("statvfs", format!("{}", error))
    }
}

impl From<String> for EngineError {
    fn from(message: String) -> EngineError {
        EngineError::new("engine", message)
    }
}

/// RPC-visible error classification, one variant per kind the Controller
/// and Node services are allowed to raise. Converts to the matching gRPC
/// status code at the façade boundary (ground:
/// `impl From<FreezeFsError> for Status` in nodeplugin_grpc.rs).
#[derive(Debug, Snafu)]
pub enum CsiError {
    #[snafu(display("invalid argument: {}", message))]
    InvalidArgument { message: String },

    #[snafu(display("{}", message))]
    OutOfRange { message: String },

    #[snafu(display("{}", message))]
    ResourceExhausted { message: String },

    #[snafu(display("{}", message))]
    NotFound { message: String },

    #[snafu(display("{}", message))]
    AlreadyExists { message: String },

    #[snafu(display("not implemented: {}", message))]
    Unimplemented { message: String },

    #[snafu(display("{}", source))]
    Internal { source: EngineError },
}

impl CsiError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        CsiError::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        CsiError::NotFound {
            message: message.into(),
        }
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        CsiError::AlreadyExists {
            message: message.into(),
        }
    }

    pub fn out_of_range(message: impl Into<String>) -> Self {
        CsiError::OutOfRange {
            message: message.into(),
        }
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        CsiError::ResourceExhausted {
            message: message.into(),
        }
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        CsiError::Unimplemented {
            message: message.into(),
        }
    }
}

impl From<EngineError> for CsiError {
    fn from(source: EngineError) -> Self {
        CsiError::Internal { source }
    }
}

impl From<CsiError> for Status {
    fn from(error: CsiError) -> Self {
        match &error {
            CsiError::InvalidArgument { .. } => {
                tracing::warn!(error = %error, "rejecting request: invalid argument");
                Status::new(Code::InvalidArgument, error.to_string())
            }
            CsiError::OutOfRange { .. } => {
                tracing::warn!(error = %error, "rejecting request: out of range");
                Status::new(Code::OutOfRange, error.to_string())
            }
            CsiError::ResourceExhausted { .. } => {
                tracing::warn!(error = %error, "rejecting request: resource exhausted");
                Status::new(Code::ResourceExhausted, error.to_string())
            }
            CsiError::NotFound { .. } => {
                tracing::warn!(error = %error, "rejecting request: not found");
                Status::new(Code::NotFound, error.to_string())
            }
            CsiError::AlreadyExists { .. } => {
                tracing::warn!(error = %error, "rejecting request: already exists");
                Status::new(Code::AlreadyExists, error.to_string())
            }
            CsiError::Unimplemented { .. } => {
                tracing::warn!(error = %error, "rejecting request: unimplemented");
                Status::new(Code::Unimplemented, error.to_string())
            }
            CsiError::Internal { .. } => {
                tracing::error!(error = %error, "internal error");
                Status::new(Code::Internal, error.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_argument_maps_to_invalid_argument_code() {
        let status: Status = CsiError::invalid_argument("bad id").into();
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[test]
    fn not_found_maps_to_not_found_code() {
        let status: Status = CsiError::not_found("missing volume").into();
        assert_eq!(status.code(), Code::NotFound);
    }

    #[test]
    fn out_of_range_maps_to_out_of_range_code() {
        let status: Status = CsiError::out_of_range("too small").into();
        assert_eq!(status.code(), Code::OutOfRange);
    }

    #[test]
    fn resource_exhausted_maps_to_resource_exhausted_code() {
        let status: Status = CsiError::resource_exhausted("pool full").into();
        assert_eq!(status.code(), Code::ResourceExhausted);
    }

    #[test]
    fn unimplemented_maps_to_unimplemented_code() {
        let status: Status = CsiError::unimplemented("block mode").into();
        assert_eq!(status.code(), Code::Unimplemented);
    }

    #[test]
    fn engine_error_maps_to_internal_code() {
        let status: Status = CsiError::from(EngineError::new("mkfs", "boom")).into();
        assert_eq!(status.code(), Code::Internal);
    }
}
