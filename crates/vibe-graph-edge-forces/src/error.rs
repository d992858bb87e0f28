//! Error types for edge-force computation.

use thiserror::Error;

use crate::backend::{BufferRole, KernelStage};

/// Errors that can occur while preparing or running edge-force passes.
#[derive(Error, Debug)]
pub enum EdgeForceError {
    /// Failed to initialize GPU device.
    #[error("GPU initialization failed: {0}")]
    GpuInit(String),

    /// A device buffer could not be allocated.
    #[error("failed to allocate {bytes} bytes for {role} buffer: {reason}")]
    ResourceAllocation {
        role: BufferRole,
        bytes: u64,
        reason: String,
    },

    /// A map or reduce launch failed on the device.
    #[error("{stage} kernel failed: {reason}")]
    KernelExecution { stage: KernelStage, reason: String },

    /// Work size rejected when binding a kernel.
    #[error("invalid work size for {stage}: global {global}, local {local}")]
    InvalidWorkSize {
        stage: KernelStage,
        global: u32,
        local: u32,
    },

    /// Buffers do not match the bound topology (stale or undersized).
    #[error("topology mismatch for {what}: expected at least {expected} bytes, got {actual}")]
    TopologyMismatch {
        what: String,
        expected: u64,
        actual: u64,
    },

    /// Host adjacency data violates the start/end table invariants.
    #[error("Invalid topology: {0}")]
    InvalidTopology(String),

    /// Failed to read back data from the device.
    #[error("readback failed: {0}")]
    Readback(String),

    /// No topology has been prepared yet.
    #[error("edge forces not prepared")]
    NotPrepared,
}

impl EdgeForceError {
    pub(crate) fn kernel(stage: KernelStage, reason: impl Into<String>) -> Self {
        Self::KernelExecution {
            stage,
            reason: reason.into(),
        }
    }

    pub(crate) fn mismatch(what: impl Into<String>, expected: u64, actual: u64) -> Self {
        Self::TopologyMismatch {
            what: what.into(),
            expected,
            actual,
        }
    }
}
