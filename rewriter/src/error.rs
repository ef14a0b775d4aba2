use thiserror::Error;

pub type Result<T> = std::result::Result<T, RewriteError>;

/// The pipeline phase an error surfaced from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Parse,
    Disassemble,
    Layout,
    Emit,
    Fixup,
    Imports,
}

#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("image parse failed: {0}")]
    Parse(String),

    #[error("only x86-64 images are supported")]
    UnsupportedMachine,

    #[error("invalid instruction at rva {rva:#x}")]
    Decode { rva: u32 },

    #[error("code blocks overlap at rva {rva:#x}")]
    BlockOverlap { rva: u32 },

    #[error("reference from rva {rva:#x} to {target:#x} lands outside every block")]
    UnresolvableTarget { rva: u32, target: u32 },

    #[error("displacement {delta:#x} at rva {rva:#x} does not fit in {width} byte(s)")]
    DisplacementOverflow {
        rva: u32,
        delta: i64,
        width: usize,
        /// Emit when the instruction is first sized, Fixup when a queued
        /// patch is applied.
        phase: Phase,
    },

    #[error("region {region} cannot hold {needed} more bytes")]
    CapacityExhausted { region: usize, needed: usize },

    #[error("region {region} cannot reach region {next} with a near jump")]
    RegionSpanTooFar { region: usize, next: usize },

    #[error("encoder produced {actual} bytes at rva {rva:#x}, predicted {predicted}")]
    EncoderMismatch {
        rva: u32,
        predicted: usize,
        actual: usize,
    },

    #[error("unresolved import {module}!{symbol}")]
    ImportResolution { module: String, symbol: String },

    #[error("image has already been written")]
    AlreadyWritten,
}

impl RewriteError {
    pub fn phase(&self) -> Phase {
        match self {
            RewriteError::Parse(_) | RewriteError::UnsupportedMachine => Phase::Parse,
            RewriteError::Decode { .. } | RewriteError::BlockOverlap { .. } => Phase::Disassemble,
            RewriteError::CapacityExhausted { .. }
            | RewriteError::RegionSpanTooFar { .. }
            | RewriteError::AlreadyWritten => Phase::Layout,
            RewriteError::UnresolvableTarget { .. } | RewriteError::EncoderMismatch { .. } => {
                Phase::Emit
            }
            RewriteError::DisplacementOverflow { phase, .. } => *phase,
            RewriteError::ImportResolution { .. } => Phase::Imports,
        }
    }
}

impl From<exe::Error> for RewriteError {
    fn from(error: exe::Error) -> Self {
        RewriteError::Parse(error.to_string())
    }
}
