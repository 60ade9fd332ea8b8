//! Protocol-database walker. The database is a circular,
//! doubly linked list living in *untrusted* target RAM — it is modeled as
//! an external graph keyed by physical address, never as owning Rust
//! references, and every pointer is validated with `valid_dxe` before it is
//! followed.

use uuid::Uuid;

use crate::addr::{
    valid_dxe, PhysAddr, PROTOCOL_ENTRY_INTERFACE_HEAD_OFFSET, PROTOCOL_ENTRY_NEXT_FIELD_OFFSET,
    PROTOCOL_ENTRY_SIGNATURE, PROTOCOL_INTERFACE_FLINK_FIELD_OFFSET,
    PROTOCOL_INTERFACE_SIGNATURE,
};
use crate::error::DiscoveryError;
use crate::transport::Transport;

/// One resolved `PROTOCOL_INTERFACE` record: its own address and the
/// protocol vtable address it points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceRecord {
    pub record_addr: PhysAddr,
    pub interface_addr: PhysAddr,
}

fn checked_read_u64<T: Transport>(
    dev: &mut T,
    from: PhysAddr,
    addr: PhysAddr,
) -> Result<PhysAddr, DiscoveryError> {
    let val = dev.read_u64(addr)?;
    if !valid_dxe(val) {
        return Err(DiscoveryError::CorruptProtocolDatabase { from, addr: val });
    }
    Ok(val)
}

/// Walks the interface list of one `ProtocolEntry`. The list head sits at
/// `entry + 0x28`; `flink == head` is treated as an empty list, matching
/// standard circular-list convention.
pub fn enum_interfaces<T: Transport>(
    dev: &mut T,
    entry_addr: PhysAddr,
) -> Result<Vec<InterfaceRecord>, DiscoveryError> {
    let head = entry_addr + PROTOCOL_ENTRY_INTERFACE_HEAD_OFFSET;
    let flink = checked_read_u64(dev, head, head)?;
    let _blink = checked_read_u64(dev, head, head + 8)?;

    let mut out = Vec::new();
    if flink == head {
        return Ok(out);
    }

    let first = flink - PROTOCOL_INTERFACE_FLINK_FIELD_OFFSET;
    let mut cursor = first;

    loop {
        if !valid_dxe(cursor) {
            return Err(DiscoveryError::CorruptProtocolDatabase { from: head, addr: cursor });
        }

        let raw = dev.read(cursor, 0x40)?;
        if raw.len() < 0x40 {
            return Err(DiscoveryError::CorruptProtocolDatabase { from: cursor, addr: cursor });
        }

        let signature = &raw[0..8];
        let next = u64::from_le_bytes(raw[0x20..0x28].try_into().unwrap());
        let prev = u64::from_le_bytes(raw[0x28..0x30].try_into().unwrap());
        let owning_entry = u64::from_le_bytes(raw[0x30..0x38].try_into().unwrap());
        let interface_addr = u64::from_le_bytes(raw[0x38..0x40].try_into().unwrap());

        if !valid_dxe(next) {
            return Err(DiscoveryError::CorruptProtocolDatabase { from: cursor, addr: next });
        }
        if !valid_dxe(prev) {
            return Err(DiscoveryError::CorruptProtocolDatabase { from: cursor, addr: prev });
        }
        if !valid_dxe(owning_entry) {
            return Err(DiscoveryError::CorruptProtocolDatabase { from: cursor, addr: owning_entry });
        }
        if interface_addr != 0 && !valid_dxe(interface_addr) {
            return Err(DiscoveryError::CorruptProtocolDatabase { from: cursor, addr: interface_addr });
        }

        if signature.starts_with(PROTOCOL_INTERFACE_SIGNATURE) {
            if owning_entry != entry_addr {
                return Err(DiscoveryError::CorruptProtocolDatabase {
                    from: cursor,
                    addr: owning_entry,
                });
            }
            out.push(InterfaceRecord { record_addr: cursor, interface_addr });
        }

        let next_cursor = next - PROTOCOL_INTERFACE_FLINK_FIELD_OFFSET;
        if next_cursor == first {
            break;
        }
        cursor = next_cursor;
    }

    Ok(out)
}

/// Visitor passed to [`enum_entries`]; traversal stops as soon as one
/// returns `Some`.
pub enum Visitor<'a> {
    /// Prints each entry's GUID (resolved through `names`, if present) and
    /// its interface list, matching the console shape of
    /// `original_source/python/uefi.py::prot_print`.
    Print { names: &'a std::collections::HashMap<Uuid, String> },
    /// Returns the interface list of the first entry whose GUID matches.
    FindByGuid { guid: Uuid },
}

pub enum VisitorResult {
    Interfaces(Vec<InterfaceRecord>),
}

/// Walks the circular doubly linked list of `PROTOCOL_ENTRY` records
/// starting at `root`, verifying the `"prte"` signature at each node and
/// invoking `visitor`. Stops and returns the visitor's result as soon as it
/// produces one; otherwise terminates when the cursor returns to `root`.
pub fn enum_entries<T: Transport>(
    dev: &mut T,
    root: PhysAddr,
    visitor: &Visitor,
) -> Result<Option<VisitorResult>, DiscoveryError> {
    let mut entry = root;

    loop {
        if !valid_dxe(entry) {
            return Err(DiscoveryError::CorruptProtocolDatabase { from: entry, addr: entry });
        }

        let raw = dev.read(entry, 0x38)?;
        if raw.len() < 0x38 {
            return Err(DiscoveryError::CorruptProtocolDatabase { from: entry, addr: entry });
        }

        let signature = &raw[0..8];
        let next = u64::from_le_bytes(raw[8..16].try_into().unwrap());
        let prev = u64::from_le_bytes(raw[16..24].try_into().unwrap());
        let guid_bytes: [u8; 16] = raw[24..40].try_into().unwrap();

        if !valid_dxe(next) {
            return Err(DiscoveryError::CorruptProtocolDatabase { from: entry, addr: next });
        }
        if !valid_dxe(prev) {
            return Err(DiscoveryError::CorruptProtocolDatabase { from: entry, addr: prev });
        }

        if signature.starts_with(PROTOCOL_ENTRY_SIGNATURE) {
            let guid = Uuid::from_bytes_le(guid_bytes);

            match visitor {
                Visitor::Print { names } => {
                    let label = names.get(&guid).cloned().unwrap_or_else(|| guid.to_string());
                    println!(" * 0x{entry:08x}: guid = {label}");
                    for intf in enum_interfaces(dev, entry)? {
                        println!("   0x{:08x}: addr = 0x{:08x}", intf.record_addr, intf.interface_addr);
                    }
                    println!();
                }
                Visitor::FindByGuid { guid: wanted } => {
                    if guid == *wanted {
                        let interfaces = enum_interfaces(dev, entry)?;
                        if !interfaces.is_empty() {
                            return Ok(Some(VisitorResult::Interfaces(interfaces)));
                        }
                    }
                }
            }
        }

        let next_entry = next - PROTOCOL_ENTRY_NEXT_FIELD_OFFSET;
        if next_entry == root {
            break;
        }
        entry = next_entry;
    }

    Ok(None)
}
