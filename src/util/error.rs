//! Error types for the ray-query subsystem.

use std::path::PathBuf;
use thiserror::Error;

use crate::device::DeviceError;

/// Main error type for subsystem operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Device has no ray-query support
    #[error("Ray queries not supported by device `{0}`")]
    Unsupported(String),

    /// Scene has no geometry objects at all
    #[error("Scene contains no geometry objects")]
    EmptyScene,

    /// Geometry object with zero triangles
    #[error("Geometry object {id} has no triangles")]
    EmptyGeometry { id: u32 },

    /// Geometry object whose byte ranges do not describe valid triangles
    #[error("Geometry object {id}: {reason}")]
    InvalidGeometry { id: u32, reason: String },

    /// Material id referenced by an object is not in the table
    #[error("Material {0} not found")]
    MaterialNotFound(u32),

    /// Two materials share an id
    #[error("Material id {0} defined twice")]
    DuplicateMaterial(u32),

    /// Program library lacks an export a technique needs
    #[error("Technique {technique}: missing program export `{export}`")]
    MissingExport {
        technique: &'static str,
        export: String,
    },

    /// Binding layout could not be serialized
    #[error("Binding layout `{layout}` failed to serialize: {reason}")]
    BindingLayout { layout: &'static str, reason: String },

    /// Camera index out of bounds
    #[error("Camera index {index} out of bounds (count: {count})")]
    CameraOutOfBounds { index: usize, count: usize },

    /// Frame target whose extent differs from the color target
    #[error("Target `{target}` is {actual:?}, color target is {expected:?}")]
    TargetSize {
        target: &'static str,
        expected: (u32, u32),
        actual: (u32, u32),
    },

    /// Record field does not fit the hardware record layout
    #[error("Invalid record layout: {0}")]
    RecordLayout(String),

    /// Settings file not found
    #[error("Settings file not found: {0}")]
    SettingsNotFound(PathBuf),

    /// Backend failure
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Settings (de)serialization error
    #[error("Settings format error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure classes of the subsystem.
///
/// `CapabilityAbsent` resolves to a permanent raster-only fallback,
/// `Construction` aborts startup, `Device` is reported upward as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    CapabilityAbsent,
    Construction,
    Device,
    Config,
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unsupported(_) => ErrorKind::CapabilityAbsent,
            Self::EmptyScene
            | Self::EmptyGeometry { .. }
            | Self::InvalidGeometry { .. }
            | Self::MaterialNotFound(_)
            | Self::DuplicateMaterial(_)
            | Self::MissingExport { .. }
            | Self::BindingLayout { .. }
            | Self::RecordLayout(_) => ErrorKind::Construction,
            Self::Device(e) if e.is_construction() => ErrorKind::Construction,
            Self::Device(_) | Self::CameraOutOfBounds { .. } | Self::TargetSize { .. } => {
                ErrorKind::Device
            }
            Self::SettingsNotFound(_) | Self::Io(_) | Self::Json(_) => ErrorKind::Config,
        }
    }

    /// Create an invalid geometry error.
    pub fn invalid_geometry(id: u32, reason: impl Into<String>) -> Self {
        Self::InvalidGeometry {
            id,
            reason: reason.into(),
        }
    }
}

/// Result type alias for subsystem operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = Error::EmptyGeometry { id: 7 };
        assert!(e.to_string().contains("7"));

        let e = Error::MissingExport {
            technique: "ShadowRays",
            export: "ShadowMiss".into(),
        };
        assert!(e.to_string().contains("ShadowMiss"));
        assert!(e.to_string().contains("ShadowRays"));
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::Unsupported("cpu".into()).kind(), ErrorKind::CapabilityAbsent);
        assert_eq!(Error::EmptyScene.kind(), ErrorKind::Construction);
        assert_eq!(
            Error::Device(DeviceError::OutOfMemory { requested: 1, available: 0 }).kind(),
            ErrorKind::Construction
        );
        assert_eq!(
            Error::Device(DeviceError::DeviceLost("reset".into())).kind(),
            ErrorKind::Device
        );
        let mismatch = Error::TargetSize {
            target: "depth",
            expected: (64, 32),
            actual: (32, 32),
        };
        assert_eq!(mismatch.kind(), ErrorKind::Device);
        assert!(mismatch.to_string().contains("depth"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "test");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
