//! Typed error kinds. Transport transience (`LinkNotReady`/`Timeout`) is
//! retried by the supervisor; `BadCompletion` is absorbed by the scanners
//! as a skip-region signal and otherwise propagated; everything else is a
//! fatal, operator-visible failure.

use crate::addr::PhysAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("PCI-E link is not ready")]
    LinkNotReady,
    #[error("DMA transaction timed out")]
    Timeout,
    #[error("bad completion reading/writing 0x{addr:x} (len={len}); likely SMRAM/TSEG or unmapped")]
    BadCompletion { addr: PhysAddr, len: usize },
}

#[derive(Debug, Error)]
pub enum PeError {
    #[error("malformed PE image: {0}")]
    Malformed(String),
    #[error("payload image has FileAlignment != SectionAlignment")]
    BadPayloadImage,
}

#[derive(Debug, Error)]
pub enum PatchError {
    #[error(transparent)]
    Pe(#[from] PeError),
    #[error("unable to find .conf section")]
    NoConfSection,
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Pe(#[from] PeError),
    #[error("unable to find EFI_SYSTEM_TABLE")]
    SystemTableNotFound,
    #[error("unable to find PROTOCOL_ENTRY")]
    ProtocolEntryNotFound,
    #[error("no interface matching the requested GUID")]
    NoMatchingInterface,
    #[error("protocol database is corrupt: invalid pointer 0x{addr:x} read from 0x{from:x}")]
    CorruptProtocolDatabase { from: PhysAddr, addr: PhysAddr },
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Patch(#[from] PatchError),
    #[error("already infected (magic present at BACKDOOR_ADDR) and reinfection is disabled")]
    AlreadyInfected,
}

/// Top-level error surfaced at the CLI boundary. `main.rs` maps each
/// variant to a distinct process exit code.
#[derive(Debug, Error)]
pub enum InfectorError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Pe(#[from] PeError),
    #[error(transparent)]
    Patch(#[from] PatchError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Install(#[from] InstallError),
    #[error("invalid scan bounds: --to (0x{to:x}) must be greater than --from (0x{from:x})")]
    InvalidScanBounds { from: PhysAddr, to: PhysAddr },
    #[error("failed to read payload image {path}: {source}")]
    PayloadIo {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to load GUID database {path}: {source}")]
    GuidDbIo {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse GUID database {path}: {source}")]
    GuidDbParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl InfectorError {
    /// Process exit code: non-zero on any raised failure.
    /// Each broad error family gets a distinct code so scripts driving the
    /// CLI can distinguish transient-looking setup mistakes from firmware
    /// corruption without parsing the message text.
    pub fn exit_code(&self) -> i32 {
        match self {
            InfectorError::Transport(_) => 2,
            InfectorError::Pe(_) | InfectorError::Patch(_) => 3,
            InfectorError::Discovery(DiscoveryError::CorruptProtocolDatabase { .. }) => 4,
            InfectorError::Discovery(_) => 5,
            InfectorError::Install(InstallError::AlreadyInfected) => 6,
            InfectorError::Install(_) => 7,
            InfectorError::InvalidScanBounds { .. } => 8,
            InfectorError::PayloadIo { .. } | InfectorError::GuidDbIo { .. } => 9,
            InfectorError::GuidDbParse { .. } => 10,
        }
    }
}
