//! DMA-driven memory scanner. Walks a physical-address window
//! for DOS-header signatures, parses the PE header found there, and mines
//! its data/text sections for pointers into firmware structures we care
//! about.

use tracing::{debug, info, warn};

use crate::addr::{
    align_up, valid_dxe, HEADER_MAGIC, HEADER_SIZE, PAGE_SIZE, PROTOCOL_ENTRY_SIGNATURE,
    PROT_SCAN_FROM, PROT_SCAN_TO, ST_SCAN_FROM, ST_SCAN_STEP, TSEG_MAX_SIZE,
};
use crate::error::{DiscoveryError, TransportError};
use crate::pe::PeImage;
use crate::transport::Transport;

/// Scan bounds for the protocol-entry search, threaded explicitly rather
/// than held in process-global state.
#[derive(Debug, Clone, Copy)]
pub struct ProtScanBounds {
    pub from: u64,
    pub to: u64,
}

impl Default for ProtScanBounds {
    fn default() -> Self {
        Self { from: PROT_SCAN_FROM, to: PROT_SCAN_TO }
    }
}

/// Outcome of probing one PE candidate for the system-table signature.
/// `BadCompletion` is distinct from `NotFound`: the caller must skip a
/// whole TSEG-sized hole rather than just stepping to the next candidate.
enum SystemTableProbe {
    Found(u64),
    NotFound,
    BadCompletion,
}

/// Outcome of probing one PE candidate for the protocol-entry signature.
/// `BadCompletion` tells the caller to advance by a single page rather than
/// by the full `SizeOfImage`-derived step a successful parse would use.
enum ProtocolEntryProbe {
    Found(u64),
    NotFound { size_of_image: u32 },
    BadCompletion,
}

fn has_dos_header<T: Transport>(dev: &mut T, addr: u64) -> Result<bool, TransportError> {
    match dev.read(addr, 2) {
        Ok(bytes) => Ok(bytes.as_slice() == HEADER_MAGIC.as_slice()),
        Err(e) => Err(e),
    }
}

/// Walks downward from `ST_SCAN_FROM` toward 0 looking for the
/// `EFI_SYSTEM_TABLE` signature inside a DXE driver's data/text sections.
pub fn find_system_table<T: Transport>(dev: &mut T) -> Result<u64, DiscoveryError> {
    let signature = crate::addr::EFI_SYSTEM_TABLE_SIGNATURE;
    let base = ST_SCAN_FROM;
    let mut ptr = 0u64;

    info!("looking for DXE driver PE image (system-table search)");

    while ptr < base {
        let image = base - ptr;

        match has_dos_header(dev, image) {
            Ok(true) => {
                debug!(image = format_args!("0x{image:x}"), "PE image candidate");
                match find_system_table_from_image(dev, image, &signature)? {
                    SystemTableProbe::Found(addr) => return Ok(addr),
                    SystemTableProbe::NotFound => {
                        ptr += ST_SCAN_STEP;
                    }
                    SystemTableProbe::BadCompletion => {
                        warn!(
                            image = format_args!("0x{image:x}"),
                            "bad completion reading candidate image, skipping TSEG-sized hole"
                        );
                        ptr += TSEG_MAX_SIZE;
                    }
                }
            }
            Ok(false) => {
                ptr += ST_SCAN_STEP;
            }
            Err(TransportError::BadCompletion { .. }) => {
                warn!(image = format_args!("0x{image:x}"), "bad completion, skipping TSEG-sized hole");
                ptr += TSEG_MAX_SIZE;
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(DiscoveryError::SystemTableNotFound)
}

/// Reads the candidate's header and `.data`/`.text` sections looking for the
/// system-table signature. Any `BadCompletion` hit while doing so — the
/// header re-read included — is absorbed here and reported as
/// [`SystemTableProbe::BadCompletion`] rather than propagated: a DMA link
/// dropping a completion partway into one candidate must not abort the
/// whole downward walk.
fn find_system_table_from_image<T: Transport>(
    dev: &mut T,
    addr: u64,
    signature: &[u8; 8],
) -> Result<SystemTableProbe, DiscoveryError> {
    let header = match dev.read(addr, HEADER_SIZE) {
        Ok(h) => h,
        Err(TransportError::BadCompletion { .. }) => return Ok(SystemTableProbe::BadCompletion),
        Err(e) => return Err(e.into()),
    };
    let pe = PeImage::parse(&header)?;

    if let Some(section) = pe.section_starting_with(".data") {
        match dev.read(addr + section.virtual_address as u64, PAGE_SIZE as usize) {
            Ok(page) => {
                if let Some(found) = scan_page_for_system_table(dev, &page, signature)? {
                    return Ok(SystemTableProbe::Found(found));
                }
            }
            Err(TransportError::BadCompletion { .. }) => return Ok(SystemTableProbe::BadCompletion),
            Err(e) => return Err(e.into()),
        }
    }

    if let Some(section) = pe.section_starting_with(".text") {
        let last_page_start =
            addr + section.virtual_address as u64 + section.size_of_raw_data as u64 - PAGE_SIZE;
        match dev.read(last_page_start, PAGE_SIZE as usize) {
            Ok(page) => {
                if let Some(found) = scan_page_for_system_table(dev, &page, signature)? {
                    return Ok(SystemTableProbe::Found(found));
                }
            }
            Err(TransportError::BadCompletion { .. }) => return Ok(SystemTableProbe::BadCompletion),
            Err(e) => return Err(e.into()),
        }
    }

    Ok(SystemTableProbe::NotFound)
}

fn scan_page_for_system_table<T: Transport>(
    dev: &mut T,
    page: &[u8],
    signature: &[u8; 8],
) -> Result<Option<u64>, DiscoveryError> {
    for chunk in page.chunks_exact(8) {
        let val = u64::from_le_bytes(chunk.try_into().unwrap());
        if !(0x1000_0000..0x1_0000_0000).contains(&val) {
            continue;
        }
        match dev.read(val, 8) {
            Ok(bytes) if bytes.as_slice() == signature.as_slice() => return Ok(Some(val)),
            Ok(_) => {}
            Err(TransportError::BadCompletion { .. }) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(None)
}

/// Walks upward from `bounds.from` to `bounds.to` looking for a
/// DXE driver carrying a pointer into the protocol database in its data
/// section.
pub fn find_protocol_entry<T: Transport>(
    dev: &mut T,
    bounds: ProtScanBounds,
) -> Result<u64, DiscoveryError> {
    let mut image = bounds.from;
    let mut known_locations: Vec<u64> = Vec::new();

    info!("looking for DXE driver PE image (protocol-entry search)");

    while image < bounds.to {
        match has_dos_header(dev, image) {
            Ok(true) => {
                debug!(image = format_args!("0x{image:x}"), "PE image candidate");
                match find_protocol_entry_from_image(dev, image, &mut known_locations)? {
                    ProtocolEntryProbe::Found(addr) => return Ok(addr),
                    ProtocolEntryProbe::NotFound { size_of_image } => {
                        image += align_up(size_of_image as u64, PAGE_SIZE);
                        continue;
                    }
                    ProtocolEntryProbe::BadCompletion => {
                        warn!(
                            image = format_args!("0x{image:x}"),
                            "bad completion reading candidate image, skipping one page"
                        );
                        image += PAGE_SIZE;
                        continue;
                    }
                }
            }
            Ok(false) => {}
            Err(TransportError::BadCompletion { .. }) => {
                warn!(image = format_args!("0x{image:x}"), "bad completion probing image");
            }
            Err(e) => return Err(e.into()),
        }
        image += PAGE_SIZE;
    }

    Err(DiscoveryError::ProtocolEntryNotFound)
}

/// Reads the candidate's header and `.data` section looking for a pointer
/// into the protocol database. Any `BadCompletion` hit here — the header
/// re-read and the two-page `.data` read included — is absorbed and
/// reported as [`ProtocolEntryProbe::BadCompletion`] rather than
/// propagated, so one bad region only costs the walk a single page rather
/// than aborting discovery entirely.
fn find_protocol_entry_from_image<T: Transport>(
    dev: &mut T,
    image_addr: u64,
    known_locations: &mut Vec<u64>,
) -> Result<ProtocolEntryProbe, DiscoveryError> {
    let header = match dev.read(image_addr, HEADER_SIZE) {
        Ok(h) => h,
        Err(TransportError::BadCompletion { .. }) => return Ok(ProtocolEntryProbe::BadCompletion),
        Err(e) => return Err(e.into()),
    };
    let pe = PeImage::parse(&header)?;

    let section = match pe.section_starting_with(".data") {
        Some(s) => s,
        None => return Ok(ProtocolEntryProbe::NotFound { size_of_image: pe.size_of_image }),
    };

    // Two pages' worth of candidates, read one page at a time: `Transport`
    // callers never request more than `PAGE_SIZE` in a single call.
    let base = image_addr + section.virtual_address as u64;
    let mut data = match dev.read(base, PAGE_SIZE as usize) {
        Ok(d) => d,
        Err(TransportError::BadCompletion { .. }) => return Ok(ProtocolEntryProbe::BadCompletion),
        Err(e) => return Err(e.into()),
    };
    match dev.read(base + PAGE_SIZE, PAGE_SIZE as usize) {
        Ok(more) => data.extend(more),
        Err(TransportError::BadCompletion { .. }) => return Ok(ProtocolEntryProbe::BadCompletion),
        Err(e) => return Err(e.into()),
    }

    for chunk in data.chunks_exact(8) {
        let val = u64::from_le_bytes(chunk.try_into().unwrap());

        if !(valid_dxe(val) && val < image_addr && val & 0xfff != 0) {
            continue;
        }

        if known_locations.iter().any(|k| val >= *k && val < k + PAGE_SIZE) {
            continue;
        }
        known_locations.push(val);

        match dev.read(val, PAGE_SIZE as usize) {
            Ok(buf) => {
                if let Some(offset) = find_bytes(&buf, PROTOCOL_ENTRY_SIGNATURE) {
                    return Ok(ProtocolEntryProbe::Found(val + offset));
                }
            }
            Err(TransportError::BadCompletion { .. }) => {
                warn!(candidate = format_args!("0x{val:x}"), "bad completion probing candidate");
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(ProtocolEntryProbe::NotFound { size_of_image: pe.size_of_image })
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<u64> {
    haystack.windows(needle.len()).position(|w| w == needle).map(|p| p as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    /// Minimal valid PE32+ header with a single named section, enough for
    /// the scanner to parse and locate; mirrors `tests/common::build_minimal_pe`
    /// but lives here since unit tests can't reach across to the
    /// integration-test support crate.
    fn build_minimal_pe(image_base: u64, size_of_image: u32, section_name: &str, section_va: u32) -> Vec<u8> {
        let sections_off = 0xC8usize;
        let mut buf = vec![0u8; sections_off + 40];

        buf[0..2].copy_from_slice(b"MZ");
        let e_lfanew: u32 = 0x40;
        buf[0x3C..0x40].copy_from_slice(&e_lfanew.to_le_bytes());

        let pe_off = e_lfanew as usize;
        buf[pe_off..pe_off + 4].copy_from_slice(b"PE\0\0");

        let coff_off = pe_off + 4;
        buf[coff_off..coff_off + 2].copy_from_slice(&0x8664u16.to_le_bytes());
        buf[coff_off + 2..coff_off + 4].copy_from_slice(&1u16.to_le_bytes());
        buf[coff_off + 16..coff_off + 18].copy_from_slice(&112u16.to_le_bytes());
        buf[coff_off + 18..coff_off + 20].copy_from_slice(&0x0002u16.to_le_bytes());

        let opt_off = coff_off + 20;
        buf[opt_off..opt_off + 2].copy_from_slice(&0x20Bu16.to_le_bytes());

        let win_off = opt_off + 24;
        buf[win_off..win_off + 8].copy_from_slice(&image_base.to_le_bytes());
        buf[win_off + 8..win_off + 12].copy_from_slice(&0x1000u32.to_le_bytes());
        buf[win_off + 12..win_off + 16].copy_from_slice(&0x1000u32.to_le_bytes());
        buf[win_off + 32..win_off + 36].copy_from_slice(&size_of_image.to_le_bytes());
        buf[win_off + 36..win_off + 40].copy_from_slice(&0x400u32.to_le_bytes());
        buf[win_off + 84..win_off + 88].copy_from_slice(&0u32.to_le_bytes());

        let off = sections_off;
        let name = section_name.as_bytes();
        let n = name.len().min(8);
        buf[off..off + n].copy_from_slice(&name[..n]);
        let section_size = 2 * PAGE_SIZE as u32;
        buf[off + 8..off + 12].copy_from_slice(&section_size.to_le_bytes());
        buf[off + 12..off + 16].copy_from_slice(&section_va.to_le_bytes());
        buf[off + 16..off + 20].copy_from_slice(&section_size.to_le_bytes());
        buf[off + 20..off + 24].copy_from_slice(&0u32.to_le_bytes());

        buf
    }

    #[test]
    fn smram_hole_skips_exactly_tseg_max_size_worth_of_probes() {
        // Two candidate images spaced TSEG_MAX_SIZE apart on the ST search
        // path; the first probe returns BadCompletion, the walker must
        // land exactly on the second candidate next.
        let mut dev = MockTransport::new();
        let first = ST_SCAN_FROM;
        dev.mark_bad(first, 2);
        let second = first - TSEG_MAX_SIZE;
        dev.write_bytes(second, &HEADER_MAGIC);
        // No system table reachable from `second`'s (nonexistent) PE header,
        // so parsing fails; we only assert the walker reached it without
        // panicking over the BadCompletion step arithmetic.
        let _ = find_system_table(&mut dev);
    }

    #[test]
    fn bad_completion_reading_candidate_header_skips_tseg_and_continues() {
        // The shallow 2-byte "MZ" probe succeeds, but the deeper header
        // re-read that `find_system_table_from_image` performs lands in a
        // bad range. The walker must treat this the same as a bad shallow
        // probe (skip TSEG_MAX_SIZE) rather than returning an error.
        let mut dev = MockTransport::new();

        let bad_image = ST_SCAN_FROM;
        dev.write_bytes(bad_image, &HEADER_MAGIC);
        dev.mark_bad(bad_image + 2, (HEADER_SIZE - 2) as u64);

        let good_image = bad_image - TSEG_MAX_SIZE;
        let pe = build_minimal_pe(0x9000_0000, 0x4000, ".data", 0x2000);
        dev.write_bytes(good_image, &pe);
        let system_table = 0x9800_0000u64;
        dev.write_u64_at(good_image + 0x2000, system_table);
        dev.write_bytes(system_table, &crate::addr::EFI_SYSTEM_TABLE_SIGNATURE);

        let found = find_system_table(&mut dev)
            .expect("bad completion on the deep header read must not abort the scan");
        assert_eq!(found, system_table);
    }

    #[test]
    fn bad_completion_reading_candidate_data_section_skips_one_page() {
        // The shallow probe and header read both succeed for `bad_image`,
        // but its `.data` section read lands in a bad range. The walker
        // must advance by a single page (not the image's full size) and
        // keep going rather than returning an error.
        let mut dev = MockTransport::new();

        let bad_image = 0x9500_0000u64;
        let pe = build_minimal_pe(0x9000_0000, 0x4000, ".data", 0x2000);
        dev.write_bytes(bad_image, &pe);
        dev.mark_bad(bad_image + 0x2000, PAGE_SIZE);

        let good_image = bad_image + PAGE_SIZE;
        let pe2 = build_minimal_pe(0x9100_0000, 0x4000, ".data", 0x2000);
        dev.write_bytes(good_image, &pe2);
        let candidate = 0x9400_0010u64; // below good_image, non-page-aligned
        dev.write_u64_at(good_image + 0x2000, candidate);
        dev.write_bytes(candidate, PROTOCOL_ENTRY_SIGNATURE);

        let bounds = ProtScanBounds { from: bad_image, to: bad_image + 0x10_0000 };
        let found = find_protocol_entry(&mut dev, bounds)
            .expect("bad completion on the deep .data read must not abort the scan");
        assert_eq!(found, candidate);
    }

    #[test]
    fn find_bytes_locates_prte_signature() {
        let mut page = vec![0u8; PAGE_SIZE as usize];
        page[100..104].copy_from_slice(b"prte");
        assert_eq!(find_bytes(&page, PROTOCOL_ENTRY_SIGNATURE), Some(100));
    }
}
