//! Address classification pass

use crate::{Address, Bitness, CodeRegions, FlowControl, Insn, OffsetMapping};

use super::{AddressKind, AddressTable};

/// Record every control-flow target and self-reference of one method.
///
/// Works by address value, so the instructions need not be sorted. Addresses
/// that already have a stronger classification keep it.
///
/// # Arguments
/// * `insns` - The method's decoded instructions
/// * `regions` - The method's own code regions
/// * `offset_map` - IL-to-native mappings, sorted by native start
/// * `bitness` - Addressing mode, used to interpret displacements
///
/// # Returns
/// The method's address table, with no names assigned yet
pub fn classify(
    insns: &[Insn],
    regions: &CodeRegions,
    offset_map: &[OffsetMapping],
    bitness: Bitness,
) -> AddressTable {
    let mut table = AddressTable::new();

    for insn in insns {
        classify_flow(&mut table, insn);

        for target in self_references(insn, regions, bitness) {
            table.record(target, AddressKind::Branch);
        }
    }

    merge_offset_map(&mut table, offset_map);

    log::debug!(
        "Classified {} addresses from {} instructions",
        table.len(),
        insns.len()
    );

    table
}

fn classify_flow(table: &mut AddressTable, insn: &Insn) {
    match insn.flow {
        FlowControl::Next | FlowControl::Interrupt | FlowControl::IndirectCall => {}
        FlowControl::UnconditionalBranch => {
            table.record(insn.next_addr(), AddressKind::Unknown);
            if let Some(target) = insn.branch_target() {
                table.record(target, AddressKind::Branch);
            }
        }
        FlowControl::ConditionalBranch | FlowControl::XbeginXabortXend => {
            if let Some(target) = insn.branch_target() {
                table.record(target, AddressKind::Branch);
            }
        }
        FlowControl::Call => {
            if let Some(target) = insn.branch_target() {
                table.record(target, AddressKind::Call);
            }
        }
        FlowControl::IndirectBranch | FlowControl::Return | FlowControl::Exception => {
            table.record(insn.next_addr(), AddressKind::Unknown);
        }
        FlowControl::Unclassified => {
            log::warn!(
                "Unclassified flow control at 0x{:x} ({}); treating it as fall-through",
                insn.addr,
                insn
            );
        }
    }
}

/// Memory references that land inside the method itself, e.g. a jump table base.
fn self_references(insn: &Insn, regions: &CodeRegions, bitness: Bitness) -> Vec<Address> {
    let Some(mem) = insn.memory() else {
        return Vec::new();
    };

    let candidates = if mem.ip_relative {
        vec![mem.displacement & bitness.mask()]
    } else {
        vec![
            mem.signed_displacement() as u64 & bitness.mask(),
            mem.unsigned_displacement() & bitness.mask(),
        ]
    };

    let mut targets: Vec<Address> = candidates
        .into_iter()
        .filter(|addr| regions.contains(*addr))
        .collect();
    targets.dedup();
    targets
}

/// Statement starts become block starts; the first mapping listed for an
/// address supplies its IL offset.
fn merge_offset_map(table: &mut AddressTable, offset_map: &[OffsetMapping]) {
    for mapping in offset_map {
        let info = table.record(mapping.native_start, AddressKind::Unknown);
        if info.kind == AddressKind::Unknown {
            info.kind = AddressKind::BlockStart;
        }
        if info.il_offset.is_none() {
            info.il_offset = Some(mapping.il_offset);
        }
    }
}
