//! GUID database — purely cosmetic, never affects discovery.
//! Maps a human-readable protocol name to its GUID, the way
//! `original_source/python/uefi.py::prot_print_load_guids` loads
//! `guids.json` (see https://github.com/binarly-io/efiXplorer).

use std::collections::HashMap;
use std::path::Path;

use uuid::Uuid;

use crate::error::InfectorError;

pub const DEFAULT_GUID_DB_PATH: &str = "guids.json";

/// Name -> GUID, keyed the way the JSON file stores it.
pub type GuidDb = HashMap<String, Uuid>;

/// Loads `path` (an object mapping name to an 11-element
/// `[d1, d2, d3, d4_0..d4_7]` array in EDK2's conventional mixed-endian
/// GUID form) into a name table. The original reshapes the trailing 6
/// bytes of `d4` into a packed 48-bit node field before constructing a
/// UUID; `Uuid::from_fields` accepts the raw 8-byte `d4` array directly, so
/// the same value is produced without the manual byte-packing step.
pub fn load(path: &Path) -> Result<GuidDb, InfectorError> {
    let text = std::fs::read_to_string(path).map_err(|e| InfectorError::GuidDbIo {
        path: path.display().to_string(),
        source: e,
    })?;

    let raw: HashMap<String, [u32; 11]> =
        serde_json::from_str(&text).map_err(|e| InfectorError::GuidDbParse {
            path: path.display().to_string(),
            source: e,
        })?;

    let mut db = GuidDb::new();
    for (name, fields) in raw {
        let d1 = fields[0];
        let d2 = fields[1] as u16;
        let d3 = fields[2] as u16;
        let d4: [u8; 8] = std::array::from_fn(|i| fields[3 + i] as u8);
        db.insert(name, Uuid::from_fields(d1, d2, d3, &d4));
    }
    Ok(db)
}

/// Inverts [`GuidDb`] into the GUID -> name lookup the protocol walker's
/// `Visitor::Print` uses.
pub fn by_guid(db: &GuidDb) -> HashMap<Uuid, String> {
    db.iter().map(|(name, guid)| (*guid, name.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reshapes_edk2_fields_into_expected_guid() {
        // ad61f191-ae5f-4c0e-b9fa-e869d288c64f, EFI_CPU_IO2_PROTOCOL_GUID,
        // encoded the way guids.json stores it.
        let mut raw = HashMap::new();
        raw.insert(
            "EFI_CPU_IO2_PROTOCOL_GUID".to_string(),
            [0xad61f191, 0xae5f, 0x4c0e, 0xb9, 0xfa, 0xe8, 0x69, 0xd2, 0x88, 0xc6, 0x4f],
        );
        let text = serde_json::to_string(&raw).unwrap();

        let tmp = std::env::temp_dir().join("infector_guiddb_test.json");
        std::fs::write(&tmp, text).unwrap();
        let db = load(&tmp).unwrap();
        std::fs::remove_file(&tmp).ok();

        assert_eq!(db.get("EFI_CPU_IO2_PROTOCOL_GUID"), Some(&crate::addr::EFI_CPU_IO2_PROTOCOL_GUID));
    }
}
