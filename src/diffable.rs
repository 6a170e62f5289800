//! Diffable output: masking run-specific addresses
//!
//! Two runs of the same program place code and data at different addresses.
//! When diffable output is requested, every operand that looks like such an
//! address is printed as [`DIFFABLE_PLACEHOLDER`] instead, so the listings of
//! unchanged code compare equal line by line.

use crate::symbols::SymbolQuery;
use crate::{Bitness, ImmediateSize, OperandKind};

/// Text printed in place of a masked address
pub const DIFFABLE_PLACEHOLDER: &str = "DIFFABLE_ADDR";

/// Inclusive range of values treated as addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    pub low: u64,
    pub high: u64,
}

impl AddressRange {
    pub fn contains(&self, value: u64) -> bool {
        value >= self.low && value <= self.high
    }
}

/// Values a 32-bit process could plausibly use as an address.
pub const ADDRESS_RANGE_32: AddressRange = AddressRange {
    low: 0x0001_0000,
    high: 0xFFFF_FFFF,
};

/// Values a 64-bit process could plausibly use as an address.
pub const ADDRESS_RANGE_64: AddressRange = AddressRange {
    low: 0x0000_0001_0000_0000,
    high: 0x7FFF_FFFF_FFFF_FFFF,
};

/// Decides which unresolved operands get masked.
#[derive(Debug, Clone, Copy)]
pub struct DiffableRewriter {
    bitness: Bitness,
    range: AddressRange,
}

impl DiffableRewriter {
    pub fn new(bitness: Bitness) -> Self {
        let range = match bitness {
            Bitness::Bits32 => ADDRESS_RANGE_32,
            Bitness::Bits64 => ADDRESS_RANGE_64,
        };
        Self { bitness, range }
    }

    pub fn range(&self) -> AddressRange {
        self.range
    }

    /// Whether the queried operand should print as the placeholder.
    ///
    /// Branch targets always do. Displacements do when their magnitude is in
    /// range. Immediates only in `mov` forms: a 64-bit immediate always, a
    /// 32-bit one only when loading a register in 32-bit code.
    pub fn is_address_shaped(&self, query: &SymbolQuery<'_>) -> bool {
        let insn = query.insn;
        match query.operand_kind() {
            Some(OperandKind::NearBranch(_)) | Some(OperandKind::FarBranch { .. }) => true,
            Some(OperandKind::Memory(mem)) => {
                let magnitude = if mem.ip_relative {
                    (mem.displacement as i64).unsigned_abs()
                } else {
                    mem.signed_displacement().unsigned_abs()
                };
                self.range.contains(magnitude)
            }
            Some(OperandKind::Immediate { value, size }) if insn.is_mov_immediate() => match size {
                ImmediateSize::Imm64 => self.range.contains(*value),
                ImmediateSize::Imm32 => {
                    self.bitness == Bitness::Bits32
                        && matches!(insn.ops.first().map(|op| &op.kind), Some(OperandKind::Register(_)))
                        && self.range.contains(*value & 0xFFFF_FFFF)
                }
                _ => false,
            },
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use crate::{FlowControl, Insn, MemorySize, Operand};
    use rstest::rstest;

    fn shaped(bitness: Bitness, insn: &Insn, operand: usize) -> bool {
        let query = SymbolQuery {
            insn,
            operand,
            address: 0,
            address_size: bitness.address_bytes(),
        };
        DiffableRewriter::new(bitness).is_address_shaped(&query)
    }

    fn mov(dest: Operand, value: u64, size: ImmediateSize) -> Insn {
        insn(
            0x1000,
            10,
            "mov dest, imm",
            FlowControl::Next,
            vec![dest, imm(value, size, MemorySize::Qword)],
        )
    }

    #[test]
    fn test_range_bounds() {
        assert!(!ADDRESS_RANGE_32.contains(0xFFFF));
        assert!(ADDRESS_RANGE_32.contains(0x0001_0000));
        assert!(ADDRESS_RANGE_32.contains(0xFFFF_FFFF));
        assert!(!ADDRESS_RANGE_64.contains(0xFFFF_FFFF));
        assert!(ADDRESS_RANGE_64.contains(0x1_0000_0000));
        assert!(!ADDRESS_RANGE_64.contains(0x8000_0000_0000_0000));
    }

    #[rstest]
    #[case(Bitness::Bits32, 0x0040_2000, 4, true)]
    #[case(Bitness::Bits32, 0xFFFF_FFF0, 4, false)] // -0x10
    #[case(Bitness::Bits32, 0x7FF0, 4, false)]
    #[case(Bitness::Bits64, 0x0040_2000, 4, false)]
    #[case(Bitness::Bits64, 0x7FF8_0000_1000, 8, true)]
    #[case(Bitness::Bits64, 0xFFFF_8000_0000_0000, 8, true)]
    fn test_displacement(
        #[case] bitness: Bitness,
        #[case] displacement: u64,
        #[case] displacement_size: u8,
        #[case] expected: bool,
    ) {
        let insn = insn(
            0x1000,
            6,
            "mov eax, dword ptr [disp]",
            FlowControl::Next,
            vec![
                reg("eax", MemorySize::Dword),
                mem(None, displacement, displacement_size, MemorySize::Dword),
            ],
        );

        assert_eq!(shaped(bitness, &insn, 1), expected);
    }

    #[test]
    fn test_ip_relative_slot() {
        let insn = insn(
            0x7FF8_0001_0000,
            6,
            "call qword ptr [rip + 0x1000]",
            FlowControl::IndirectCall,
            vec![rip(0x7FF8_0001_1006, MemorySize::Qword)],
        );

        assert!(shaped(Bitness::Bits64, &insn, 0));
    }

    #[rstest]
    #[case(Bitness::Bits32, 0x0040_2000, ImmediateSize::Imm32, true)]
    #[case(Bitness::Bits32, 0x1000, ImmediateSize::Imm32, false)]
    #[case(Bitness::Bits64, 0x0040_2000, ImmediateSize::Imm32, false)]
    #[case(Bitness::Bits64, 0x7FF8_1234_5678, ImmediateSize::Imm64, true)]
    #[case(Bitness::Bits64, 0x1234, ImmediateSize::Imm64, false)]
    #[case(Bitness::Bits64, 0x7FF8_1234_5678, ImmediateSize::Imm32to64, false)]
    fn test_mov_immediate_into_register(
        #[case] bitness: Bitness,
        #[case] value: u64,
        #[case] size: ImmediateSize,
        #[case] expected: bool,
    ) {
        let insn = mov(reg("eax", MemorySize::Dword), value, size);

        assert_eq!(shaped(bitness, &insn, 1), expected);
    }

    #[test]
    fn test_mov_immediate_into_memory_kept() {
        let insn = mov(
            mem(Some("ebp"), 0xF8, 1, MemorySize::Dword),
            0x0040_2000,
            ImmediateSize::Imm32,
        );

        assert!(!shaped(Bitness::Bits32, &insn, 1));
    }

    #[test]
    fn test_non_mov_immediate_kept() {
        let push = insn(
            0x1000,
            5,
            "push 0x402000",
            FlowControl::Next,
            vec![imm(0x0040_2000, ImmediateSize::Imm32, MemorySize::Dword)],
        );

        assert!(!shaped(Bitness::Bits32, &push, 0));
    }

    #[test]
    fn test_branch_targets_always_masked() {
        let call = insn(0x1000, 5, "call 0x2000", FlowControl::Call, vec![near(0x2000)]);
        let far = insn(
            0x1000,
            7,
            "ljmp 0x10:0x2000",
            FlowControl::UnconditionalBranch,
            vec![Operand::new(
                OperandKind::FarBranch { selector: 0x10, offset: 0x2000 },
                MemorySize::Unknown,
            )],
        );

        assert!(shaped(Bitness::Bits64, &call, 0));
        assert!(shaped(Bitness::Bits32, &far, 0));
    }
}
