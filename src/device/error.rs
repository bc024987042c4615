//! Backend error type.

use thiserror::Error;

use super::{ResourceId, ResourceState, SubmissionId};

/// Failures reported by a [`RayDevice`](super::RayDevice).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    /// Allocation exceeds the remaining device memory budget
    #[error("Out of device memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: u64, available: u64 },

    /// Device was removed or hung
    #[error("Device lost: {0}")]
    DeviceLost(String),

    /// Device lacks a required capability
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Handle does not name a live object
    #[error("Invalid {kind} handle {index}")]
    InvalidHandle { kind: &'static str, index: u32 },

    /// Resource is not in the state the operation requires
    #[error("{resource:?} is in state {actual:?}, expected {expected:?}")]
    InvalidState {
        resource: ResourceId,
        expected: ResourceState,
        actual: ResourceState,
    },

    /// A read of data written by an earlier GPU operation with no fence in between
    #[error("Read of {resource:?} without a memory fence after the write")]
    Hazard { resource: ResourceId },

    /// Byte range outside a buffer or texture
    #[error("Range {offset}+{len} outside resource of {size} bytes")]
    OutOfBounds { offset: u64, len: u64, size: u64 },

    /// Scratch buffer smaller than prebuild info demands
    #[error("Scratch buffer too small: {provided} bytes, {required} required")]
    ScratchTooSmall { required: u64, provided: u64 },

    /// Acceleration structure destination smaller than prebuild info demands
    #[error("Acceleration structure buffer too small: {provided} bytes, {required} required")]
    DestinationTooSmall { required: u64, provided: u64 },

    /// Buffer does not contain a built acceleration structure
    #[error("Buffer {0} holds no acceleration structure")]
    NotAccelerationStructure(u32),

    /// Program library blob could not be parsed
    #[error("Malformed program library: {0}")]
    MalformedLibrary(String),

    /// Pipeline references an export the library does not provide
    #[error("Missing program export `{0}`")]
    MissingExport(String),

    /// Binding layout could not be serialized
    #[error("Binding layout serialization failed: {0}")]
    LayoutSerialization(String),

    /// Dispatch issued without a required binding
    #[error("Nothing bound for {0}")]
    Unbound(&'static str),

    /// Address or stride violates a required alignment
    #[error("{what} {value} is not a multiple of {alignment}")]
    Misaligned {
        what: &'static str,
        value: u64,
        alignment: u64,
    },

    /// Hit-group record index outside the bound table
    #[error("Hit-group record {index} outside table of {count} records")]
    RecordOutOfRange { index: u64, count: u64 },

    /// Record does not carry a valid program identifier
    #[error("Record {0} carries an unknown program identifier")]
    UnknownIdentifier(u64),

    /// Dispatch names a program the bound pipeline does not contain
    #[error("Dispatch {0} identifier does not belong to the bound pipeline")]
    IdentifierMismatch(&'static str),

    /// Trace nested deeper than the pipeline allows
    #[error("Trace recursion depth {depth} exceeds pipeline maximum {max}")]
    RecursionExceeded { depth: u32, max: u32 },

    /// Trace needs more stack than the pipeline budget
    #[error("Stack overflow: {required} bytes required, budget {budget}")]
    StackOverflow { required: u64, budget: u64 },

    /// Wait on a submission that was never issued
    #[error("Queue stall: waiting on {0:?}, which was never submitted")]
    QueueStall(SubmissionId),
}

impl DeviceError {
    /// Whether this failure can only happen while building startup objects.
    pub fn is_construction(&self) -> bool {
        matches!(
            self,
            Self::OutOfMemory { .. }
                | Self::ScratchTooSmall { .. }
                | Self::DestinationTooSmall { .. }
                | Self::MalformedLibrary(_)
                | Self::MissingExport(_)
                | Self::LayoutSerialization(_)
        )
    }
}
