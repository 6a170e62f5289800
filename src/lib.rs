//! Core IR, collaborator traits, and errors for the JIT listing engine.
//!
//! This library turns the decoded instruction stream of one compiled method
//! into an annotated listing: internal branch and call targets get synthetic
//! labels, operand addresses are resolved to symbolic names, source statements
//! are interleaved, and (optionally) run-specific addresses are masked so two
//! listings of the same code compare equal with a plain text diff.
//!
//! # Basic Usage
//!
//! ```rust,no_run
//! use jit_listing::{
//!     decoder::{AssemblySyntax, CapstoneDecoder},
//!     dump::DumpFile,
//!     format::OutputFormat,
//!     render::{RenderOptions, Renderer},
//!     source::SourceCache,
//!     symbols::SymbolCache,
//! };
//!
//! // Load a method dump captured from a running process
//! let dump = DumpFile::load("methods.json").unwrap();
//! let decoder = CapstoneDecoder::new(dump.bitness().unwrap(), AssemblySyntax::Intel);
//!
//! // Caches live for the whole dump and are shared by every method
//! let symbols = SymbolCache::new();
//! let sources = SourceCache::new();
//! let provider = dump.symbols();
//! let mapper = dump.sources(None);
//!
//! let options = RenderOptions::default();
//! let renderer = Renderer::new(&decoder, &provider, &symbols, &sources, options)
//!     .with_source_mapper(&mapper);
//!
//! let formatter = OutputFormat::Text.get_formatter();
//! for method in dump.methods().unwrap() {
//!     let listing = renderer.render(&method).unwrap();
//!     print!("{}", formatter.format(&listing).unwrap());
//! }
//! ```

pub mod analysis;
pub mod decoder;
pub mod diffable;
pub mod dump;
pub mod format;
pub mod job;
pub mod render;
pub mod source;
pub mod symbols;

/// Represents an address in memory
pub type Address = u64;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::source::SequencePoint;
use crate::symbols::{SymbolQuery, SymbolResult};

/// Addressing mode of the code being listed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bitness {
    /// 32-bit x86
    Bits32,
    /// 64-bit x86
    Bits64,
}

impl Bitness {
    /// Map a bit count (32 or 64) to a bitness.
    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            32 => Some(Bitness::Bits32),
            64 => Some(Bitness::Bits64),
            _ => None,
        }
    }

    /// Number of address bits.
    pub fn bits(self) -> u32 {
        match self {
            Bitness::Bits32 => 32,
            Bitness::Bits64 => 64,
        }
    }

    /// Width of a native address in bytes.
    pub fn address_bytes(self) -> u8 {
        match self {
            Bitness::Bits32 => 4,
            Bitness::Bits64 => 8,
        }
    }

    /// Mask that truncates a value to a native address.
    pub fn mask(self) -> u64 {
        match self {
            Bitness::Bits32 => u32::MAX as u64,
            Bitness::Bits64 => u64::MAX,
        }
    }
}

impl fmt::Display for Bitness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bitness::Bits32 => write!(f, "32-bit"),
            Bitness::Bits64 => write!(f, "64-bit"),
        }
    }
}

/// How an instruction transfers control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowControl {
    /// Falls through to the next instruction
    Next,
    /// `jmp` with a statically known target
    UnconditionalBranch,
    /// `jmp` through a register or memory
    IndirectBranch,
    /// `jcc`, `loop`, `jecxz` and friends
    ConditionalBranch,
    /// `ret`, `iret`, `sysret`
    Return,
    /// `call` with a statically known target
    Call,
    /// `call` through a register or memory
    IndirectCall,
    /// `int`, `int3`, `syscall`
    Interrupt,
    /// `xbegin`, `xabort`, `xend`
    XbeginXabortXend,
    /// Instructions that always raise (`ud2`)
    Exception,
    /// The decoder could not tell; treated as a defect and as fall-through
    Unclassified,
}

/// Width of a memory access or operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemorySize {
    Unknown,
    Byte,
    Word,
    Dword,
    Qword,
    Tbyte,
    Xmmword,
    Ymmword,
    Zmmword,
}

impl MemorySize {
    /// Size from a byte count.
    pub fn from_bytes(bytes: u8) -> Self {
        match bytes {
            1 => MemorySize::Byte,
            2 => MemorySize::Word,
            4 => MemorySize::Dword,
            8 => MemorySize::Qword,
            10 => MemorySize::Tbyte,
            16 => MemorySize::Xmmword,
            32 => MemorySize::Ymmword,
            64 => MemorySize::Zmmword,
            _ => MemorySize::Unknown,
        }
    }

    /// Intel-syntax size keyword (`qword` in `qword ptr`).
    pub fn keyword(self) -> Option<&'static str> {
        match self {
            MemorySize::Unknown => None,
            MemorySize::Byte => Some("byte"),
            MemorySize::Word => Some("word"),
            MemorySize::Dword => Some("dword"),
            MemorySize::Qword => Some("qword"),
            MemorySize::Tbyte => Some("tbyte"),
            MemorySize::Xmmword => Some("xmmword"),
            MemorySize::Ymmword => Some("ymmword"),
            MemorySize::Zmmword => Some("zmmword"),
        }
    }
}

/// Encoded size of an immediate, including sign-extended forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImmediateSize {
    Imm8,
    Imm16,
    Imm32,
    Imm64,
    Imm8to16,
    Imm8to32,
    Imm8to64,
    Imm32to64,
}

/// A memory operand. For IP-relative operands `displacement` holds the
/// absolute target address rather than the encoded offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryOperand {
    pub base: Option<String>,
    pub index: Option<String>,
    pub scale: u8,
    pub displacement: u64,
    /// Encoded displacement width in bytes (0, 1, 2, 4 or 8)
    pub displacement_size: u8,
    pub ip_relative: bool,
}

impl MemoryOperand {
    /// Displacement sign-extended from its encoded width.
    pub fn signed_displacement(&self) -> i64 {
        match self.displacement_size {
            0 => 0,
            1 => self.displacement as u8 as i8 as i64,
            2 => self.displacement as u16 as i16 as i64,
            4 => self.displacement as u32 as i32 as i64,
            _ => self.displacement as i64,
        }
    }

    /// Displacement zero-extended from its encoded width.
    pub fn unsigned_displacement(&self) -> u64 {
        match self.displacement_size {
            0 => 0,
            1 => self.displacement & 0xff,
            2 => self.displacement & 0xffff,
            4 => self.displacement & 0xffff_ffff,
            _ => self.displacement,
        }
    }

    /// True when the operand is a bare `[disp]` with no registers.
    pub fn is_absolute(&self) -> bool {
        !self.ip_relative && self.base.is_none() && self.index.is_none()
    }
}

/// Operand shapes the engine cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperandKind {
    Register(String),
    NearBranch(Address),
    FarBranch { selector: u16, offset: u32 },
    /// `value` is already sign-extended to the operand width
    Immediate { value: u64, size: ImmediateSize },
    Memory(MemoryOperand),
}

/// One instruction operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operand {
    pub kind: OperandKind,
    /// Width of the value the operand reads or writes
    pub size: MemorySize,
}

impl Operand {
    pub fn new(kind: OperandKind, size: MemorySize) -> Self {
        Self { kind, size }
    }
}

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Insn {
    /// Address of the instruction
    pub addr: Address,
    /// Size of the instruction in bytes
    pub size: u8,
    /// Instruction mnemonic (e.g., "mov", "call")
    pub mnemonic: String,
    /// Operands as rendered by the decoder, without symbols
    pub operands: String,
    /// Flow-control class
    pub flow: FlowControl,
    /// Structured operands, in the same order as the operand text
    pub ops: Vec<Operand>,
}

impl Insn {
    /// Address of the instruction that follows this one.
    pub fn next_addr(&self) -> Address {
        self.addr.wrapping_add(self.size as Address)
    }

    /// Direct near branch target, if the instruction has one.
    pub fn branch_target(&self) -> Option<Address> {
        self.ops.iter().find_map(|op| match op.kind {
            OperandKind::NearBranch(target) => Some(target),
            _ => None,
        })
    }

    /// First memory operand, if any.
    pub fn memory(&self) -> Option<&MemoryOperand> {
        self.ops.iter().find_map(|op| match &op.kind {
            OperandKind::Memory(mem) => Some(mem),
            _ => None,
        })
    }

    /// True for `mov reg/mem, imm` forms (including `movabs` and AT&T suffixes).
    pub fn is_mov_immediate(&self) -> bool {
        let mnemonic = base_mnemonic(&self.mnemonic);
        let is_mov = matches!(
            mnemonic,
            "mov" | "movl" | "movq" | "movabs" | "movabsq"
        );
        is_mov
            && self
                .ops
                .iter()
                .any(|op| matches!(op.kind, OperandKind::Immediate { .. }))
    }

    /// True for `call [mem]` / `jmp [mem]`.
    pub fn is_memory_call_or_jump(&self) -> bool {
        matches!(self.flow, FlowControl::IndirectCall | FlowControl::IndirectBranch)
            && self.memory().is_some()
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.operands.is_empty() {
            write!(f, "{}", self.mnemonic)
        } else {
            write!(f, "{} {}", self.mnemonic, self.operands)
        }
    }
}

/// Strip prefixes such as `bnd`/`notrack`/`lock` and return the final mnemonic word.
pub(crate) fn base_mnemonic(mnemonic: &str) -> &str {
    mnemonic.split_whitespace().last().unwrap_or("")
}

/// A contiguous native code range and the bytes it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeRegion {
    /// Starting address of the region
    pub address: Address,
    /// Raw code bytes
    pub bytes: Vec<u8>,
}

impl CodeRegion {
    /// Create a new region
    pub fn new(address: Address, bytes: Vec<u8>) -> Self {
        Self { address, bytes }
    }

    /// First address past the region
    pub fn end_address(&self) -> Address {
        self.address.saturating_add(self.bytes.len() as Address)
    }

    /// Whether `addr` falls inside the region
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.address && addr < self.end_address()
    }
}

/// The disjoint hot/cold regions of one method, sorted by address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeRegions {
    regions: Vec<CodeRegion>,
}

impl CodeRegions {
    /// Sort the regions and reject any overlap, or a region that runs past
    /// the end of the address space.
    pub fn new(mut regions: Vec<CodeRegion>) -> Result<Self, DisassemblyError> {
        regions.sort_by_key(|r| r.address);
        if let Some(region) = regions
            .iter()
            .find(|r| r.address.checked_add(r.bytes.len() as Address).is_none())
        {
            return Err(DisassemblyError::DumpError(format!(
                "region at 0x{:x} ({} bytes) overflows the address space",
                region.address,
                region.bytes.len()
            )));
        }
        for pair in regions.windows(2) {
            if pair[1].address < pair[0].end_address() {
                return Err(DisassemblyError::OverlappingRegions {
                    first: pair[0].address,
                    second: pair[1].address,
                });
            }
        }
        Ok(Self { regions })
    }

    /// The region containing `addr`
    pub fn find(&self, addr: Address) -> Option<&CodeRegion> {
        self.regions.iter().find(|r| r.contains(addr))
    }

    /// Whether `addr` belongs to the method
    pub fn contains(&self, addr: Address) -> bool {
        self.find(addr).is_some()
    }

    /// Raw bytes backing `[addr, addr + len)`.
    pub fn bytes_at(&self, addr: Address, len: usize) -> Result<&[u8], DisassemblyError> {
        let missing = || DisassemblyError::MissingCodeRegion { address: addr, length: len };
        let region = self.find(addr).ok_or_else(missing)?;
        let start = (addr - region.address) as usize;
        region.bytes.get(start..start + len).ok_or_else(missing)
    }

    /// Total number of code bytes
    pub fn total_size(&self) -> u64 {
        self.regions.iter().map(|r| r.bytes.len() as u64).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CodeRegion> {
        self.regions.iter()
    }
}

/// Relates one IL offset to a native range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetMapping {
    /// IL offset; negative values are runtime sentinels (prolog, epilog, no mapping)
    pub il_offset: i32,
    pub native_start: Address,
    pub native_end: Address,
}

/// IL offset sentinel: no IL instruction maps here
pub const IL_NO_MAPPING: i32 = -1;
/// IL offset sentinel: method prolog
pub const IL_PROLOG: i32 = -2;
/// IL offset sentinel: method epilog
pub const IL_EPILOG: i32 = -3;

/// Everything known about one compiled method before rendering.
#[derive(Debug, Clone)]
pub struct NativeMethod {
    /// Fully-qualified method name
    pub name: String,
    /// Metadata token, when the runtime reported one
    pub token: Option<u32>,
    pub regions: CodeRegions,
    /// Sorted by native start, then native end
    pub offset_map: Vec<OffsetMapping>,
}

impl NativeMethod {
    /// Build a method, sorting its offset map. The sort is stable, so among
    /// mappings with the same range the one listed first stays first.
    pub fn new(
        name: impl Into<String>,
        token: Option<u32>,
        regions: CodeRegions,
        mut offset_map: Vec<OffsetMapping>,
    ) -> Self {
        offset_map.sort_by_key(|m| (m.native_start, m.native_end));
        Self {
            name: name.into(),
            token,
            regions,
            offset_map,
        }
    }

    /// Total code size in bytes
    pub fn code_size(&self) -> u64 {
        self.regions.total_size()
    }
}

/// A compiled method known to the symbol provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSymbol {
    pub name: String,
    /// `(start, length)` of each code extent (hot, then cold)
    pub code: Vec<(Address, u64)>,
}

impl MethodSymbol {
    /// Whether `addr` lies inside the method's actual code.
    pub fn code_contains(&self, addr: Address) -> bool {
        self.code
            .iter()
            .any(|&(start, len)| addr >= start && addr - start < len)
    }
}

/// Decoder trait: the instruction source for one architecture.
pub trait Decoder: Send + Sync {
    /// Addressing mode this decoder produces instructions for
    fn bitness(&self) -> Bitness;

    /// Comment marker for the decoder's assembly syntax
    fn comment_prefix(&self) -> &'static str;

    /// Decode every instruction in `code`, which starts at `address`.
    fn decode(&self, code: &[u8], address: Address) -> Result<Vec<Insn>, DisassemblyError>;

    /// Render `insn` to text, asking `resolve` for a name for each
    /// address-bearing operand.
    fn format(
        &self,
        insn: &Insn,
        resolve: &mut dyn FnMut(&SymbolQuery<'_>) -> Option<SymbolResult>,
    ) -> String;
}

/// Runtime-level names for addresses outside the method being listed.
pub trait SymbolProvider: Send + Sync {
    /// Name of a runtime helper routine at `address`
    fn helper_name(&self, address: Address) -> Option<String>;

    /// Name of the type whose method table lives at `address`
    fn method_table_name(&self, address: Address) -> Option<String>;

    /// The compiled method nearest to `address`; the caller checks its extent
    fn method_at(&self, address: Address) -> Option<MethodSymbol>;
}

/// A provider that knows no symbols.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSymbols;

impl SymbolProvider for NoSymbols {
    fn helper_name(&self, _address: Address) -> Option<String> {
        None
    }

    fn method_table_name(&self, _address: Address) -> Option<String> {
        None
    }

    fn method_at(&self, _address: Address) -> Option<MethodSymbol> {
        None
    }
}

/// Maps a method's IL offsets to source sequence points.
pub trait SourceMapper: Send + Sync {
    fn sequence_point(&self, method: &NativeMethod, il_offset: u32) -> Option<SequencePoint>;
}

/// Error type for listing operations
#[derive(Debug, thiserror::Error)]
pub enum DisassemblyError {
    /// Decoder error
    #[error("Decoder error: {0}")]
    DecoderError(#[from] decoder::DecoderError),

    /// An instruction's bytes are not backed by any code region
    #[error("No code region backs {length} byte(s) at 0x{address:x}")]
    MissingCodeRegion { address: Address, length: usize },

    /// Two code regions of one method overlap
    #[error("Code regions at 0x{first:x} and 0x{second:x} overlap")]
    OverlappingRegions { first: Address, second: Address },

    /// Malformed method dump
    #[error("Invalid method dump: {0}")]
    DumpError(String),

    /// JSON error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Instruction builders shared by the unit tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub fn insn(addr: Address, size: u8, text: &str, flow: FlowControl, ops: Vec<Operand>) -> Insn {
        let (mnemonic, operands) = match text.split_once(' ') {
            Some((m, o)) => (m.to_string(), o.to_string()),
            None => (text.to_string(), String::new()),
        };
        Insn {
            addr,
            size,
            mnemonic,
            operands,
            flow,
            ops,
        }
    }

    pub fn reg(name: &str, size: MemorySize) -> Operand {
        Operand::new(OperandKind::Register(name.to_string()), size)
    }

    pub fn near(target: Address) -> Operand {
        Operand::new(OperandKind::NearBranch(target), MemorySize::Qword)
    }

    pub fn imm(value: u64, size: ImmediateSize, width: MemorySize) -> Operand {
        Operand::new(OperandKind::Immediate { value, size }, width)
    }

    pub fn rip(target: Address, size: MemorySize) -> Operand {
        Operand::new(
            OperandKind::Memory(MemoryOperand {
                base: None,
                index: None,
                scale: 1,
                displacement: target,
                displacement_size: 8,
                ip_relative: true,
            }),
            size,
        )
    }

    pub fn mem(base: Option<&str>, displacement: u64, displacement_size: u8, size: MemorySize) -> Operand {
        Operand::new(
            OperandKind::Memory(MemoryOperand {
                base: base.map(str::to_string),
                index: None,
                scale: 1,
                displacement,
                displacement_size,
                ip_relative: false,
            }),
            size,
        )
    }

    pub fn regions(spans: &[(Address, usize)]) -> CodeRegions {
        CodeRegions::new(
            spans
                .iter()
                .map(|&(addr, len)| CodeRegion::new(addr, vec![0x90; len]))
                .collect(),
        )
        .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_code_regions_lookup() {
        let regions = regions(&[(0x2000, 0x10), (0x1000, 0x20)]);

        assert!(regions.contains(0x1000));
        assert!(regions.contains(0x101f));
        assert!(!regions.contains(0x1020));
        assert!(regions.contains(0x200f));
        assert_eq!(regions.find(0x2004).unwrap().address, 0x2000);
        assert_eq!(regions.total_size(), 0x30);
    }

    #[test]
    fn test_overlapping_regions_rejected() {
        let result = CodeRegions::new(vec![
            CodeRegion::new(0x1000, vec![0; 0x20]),
            CodeRegion::new(0x1010, vec![0; 0x20]),
        ]);

        assert!(matches!(
            result,
            Err(DisassemblyError::OverlappingRegions { first: 0x1000, second: 0x1010 })
        ));
    }

    #[test]
    fn test_region_past_address_space_rejected() {
        let result = CodeRegions::new(vec![
            CodeRegion::new(0x1000, vec![0x90; 4]),
            CodeRegion::new(u64::MAX - 1, vec![0x90; 4]),
        ]);

        assert!(matches!(result, Err(DisassemblyError::DumpError(_))));
        assert!(CodeRegions::new(vec![CodeRegion::new(u64::MAX - 4, vec![0x90; 4])]).is_ok());
    }

    #[test]
    fn test_bytes_at_outside_regions() {
        let regions = CodeRegions::new(vec![CodeRegion::new(0x1000, vec![0x48, 0x83, 0xec, 0x28])]).unwrap();

        assert_eq!(regions.bytes_at(0x1001, 2).unwrap(), &[0x83, 0xec]);
        // Runs past the end of the region
        assert!(regions.bytes_at(0x1003, 2).is_err());
        assert!(matches!(
            regions.bytes_at(0x5000, 1),
            Err(DisassemblyError::MissingCodeRegion { address: 0x5000, length: 1 })
        ));
    }

    #[test]
    fn test_signed_displacement() {
        let mut mem = MemoryOperand {
            base: Some("rbp".to_string()),
            index: None,
            scale: 1,
            displacement: 0xf0,
            displacement_size: 1,
            ip_relative: false,
        };
        assert_eq!(mem.signed_displacement(), -0x10);

        mem.displacement = 0xffff_fff0;
        mem.displacement_size = 4;
        assert_eq!(mem.signed_displacement(), -0x10);

        mem.displacement = 0x7fff_0000_0000;
        mem.displacement_size = 8;
        assert_eq!(mem.signed_displacement(), 0x7fff_0000_0000);
    }

    #[test]
    fn test_offset_map_sorted_stably() {
        let method = NativeMethod::new(
            "M",
            None,
            regions(&[(0x1000, 0x10)]),
            vec![
                OffsetMapping { il_offset: 7, native_start: 0x1008, native_end: 0x1010 },
                OffsetMapping { il_offset: 3, native_start: 0x1000, native_end: 0x1008 },
                OffsetMapping { il_offset: 1, native_start: 0x1000, native_end: 0x1008 },
            ],
        );

        let offsets: Vec<i32> = method.offset_map.iter().map(|m| m.il_offset).collect();
        assert_eq!(offsets, vec![3, 1, 7]);
        assert_eq!(method.code_size(), 0x10);
    }

    #[test]
    fn test_insn_helpers() {
        let call = insn(
            0x1000,
            6,
            "call qword ptr [rip + 0x10]",
            FlowControl::IndirectCall,
            vec![rip(0x1016, MemorySize::Qword)],
        );
        assert!(call.is_memory_call_or_jump());
        assert_eq!(call.next_addr(), 0x1006);
        assert_eq!(call.to_string(), "call qword ptr [rip + 0x10]");

        let mov = insn(
            0x1006,
            10,
            "movabs rax, 0x7ff812345678",
            FlowControl::Next,
            vec![
                reg("rax", MemorySize::Qword),
                imm(0x7ff8_1234_5678, ImmediateSize::Imm64, MemorySize::Qword),
            ],
        );
        assert!(mov.is_mov_immediate());
        assert!(!mov.is_memory_call_or_jump());
    }

    #[test]
    fn test_method_symbol_extent() {
        let symbol = MethodSymbol {
            name: "Other".to_string(),
            code: vec![(0x4000, 0x20), (0x9000, 0x8)],
        };

        assert!(symbol.code_contains(0x4000));
        assert!(symbol.code_contains(0x9007));
        assert!(!symbol.code_contains(0x4020));
        assert!(!symbol.code_contains(0x3fff));
    }
}
