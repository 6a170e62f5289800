//! Synthetic label assignment

use crate::CodeRegions;

use super::{AddressKind, AddressTable};

/// Prefix for branch, block and data labels
pub const LABEL_PREFIX: &str = "LBL_";
/// Prefix for call targets inside the method
pub const FUNCTION_PREFIX: &str = "FNC_";

/// Name every classified address inside `regions`, in address order.
///
/// Call targets draw from the function counter, everything else from the
/// label counter. `Unknown` addresses stay unnamed; they only mark a block
/// boundary. Addresses outside the method are left for external symbol
/// lookup.
pub fn assign_labels(table: &mut AddressTable, regions: &CodeRegions) {
    let mut labels = 0usize;
    let mut functions = 0usize;

    for (addr, info) in table.iter_mut() {
        if info.name.is_some() || !regions.contains(addr) {
            continue;
        }

        let name = match info.kind {
            AddressKind::Unknown => continue,
            AddressKind::Call => {
                functions += 1;
                format!("{}{}", FUNCTION_PREFIX, functions - 1)
            }
            AddressKind::Data | AddressKind::BlockStart | AddressKind::Branch => {
                labels += 1;
                format!("{}{}", LABEL_PREFIX, labels - 1)
            }
        };
        info.name = Some(name);
    }

    log::debug!("Assigned {} labels and {} function names", labels, functions);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::classify;
    use crate::testing::*;
    use crate::{Bitness, FlowControl, OffsetMapping};

    #[test]
    fn test_branch_to_own_start() {
        let regions = regions(&[(0x1000, 0x4)]);
        let insns = vec![
            insn(0x1000, 2, "nop", FlowControl::Next, vec![]),
            insn(0x1002, 2, "jmp 0x1000", FlowControl::UnconditionalBranch, vec![near(0x1000)]),
        ];
        let offset_map = vec![OffsetMapping { il_offset: 0, native_start: 0x1000, native_end: 0x1002 }];

        let mut table = classify(&insns, &regions, &offset_map, Bitness::Bits64);
        assign_labels(&mut table, &regions);

        assert_eq!(table.name(0x1000), Some("LBL_0"));
        // The fall-through after the jmp is past the end of the method
        assert_eq!(table.name(0x1004), None);
        let named = table.iter().filter(|(_, info)| info.name.is_some()).count();
        assert_eq!(named, 1);
    }

    #[test]
    fn test_independent_counters_in_address_order() {
        let regions = regions(&[(0x1000, 0x100)]);
        let mut table = AddressTable::new();
        table.record(0x1080, AddressKind::Call);
        table.record(0x1040, AddressKind::Branch);
        table.record(0x1020, AddressKind::Call);
        table.record(0x1010, AddressKind::Data);
        table.record(0x1060, AddressKind::BlockStart);
        table.record(0x1030, AddressKind::Unknown);

        assign_labels(&mut table, &regions);

        assert_eq!(table.name(0x1010), Some("LBL_0"));
        assert_eq!(table.name(0x1020), Some("FNC_0"));
        assert_eq!(table.name(0x1030), None);
        assert_eq!(table.name(0x1040), Some("LBL_1"));
        assert_eq!(table.name(0x1060), Some("LBL_2"));
        assert_eq!(table.name(0x1080), Some("FNC_1"));
    }

    #[test]
    fn test_external_addresses_not_named() {
        let regions = regions(&[(0x1000, 0x10)]);
        let mut table = AddressTable::new();
        table.record(0x9000, AddressKind::Call);
        table.record(0x1004, AddressKind::Call);

        assign_labels(&mut table, &regions);

        assert_eq!(table.name(0x9000), None);
        assert_eq!(table.name(0x1004), Some("FNC_0"));
    }

    #[test]
    fn test_names_unique_across_cold_region() {
        let regions = regions(&[(0x1000, 0x10), (0x8000, 0x10)]);
        let mut table = AddressTable::new();
        for addr in [0x8004, 0x1008, 0x8000, 0x1000] {
            table.record(addr, AddressKind::Branch);
        }

        assign_labels(&mut table, &regions);
        // A second pass must not rename anything
        assign_labels(&mut table, &regions);

        let names: Vec<&str> = table.iter().filter_map(|(_, info)| info.name.as_deref()).collect();
        assert_eq!(names, vec!["LBL_0", "LBL_1", "LBL_2", "LBL_3"]);
    }
}
