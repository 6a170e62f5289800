//! Capstone-based x86/x64 instruction source.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use capstone::arch::x86::{X86OpMem, X86OperandType, X86Reg};
use capstone::prelude::*;
use clap::ValueEnum;

use crate::symbols::{SymbolQuery, SymbolResult};
use crate::{
    base_mnemonic, Address, Bitness, Decoder, DisassemblyError, FlowControl, ImmediateSize, Insn,
    MemoryOperand, MemorySize, Operand, OperandKind,
};

/// Errors that can occur during decoding
#[derive(Debug, thiserror::Error)]
pub enum DecoderError {
    /// Capstone error
    #[error("Capstone error: {0}")]
    CapstoneError(#[from] capstone::Error),

    /// Capstone returned an instruction without x86 detail
    #[error("No x86 detail for instruction at 0x{0:x}")]
    MissingDetail(Address),
}

/// Assembly syntax used to render instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum AssemblySyntax {
    /// Intel syntax, `0x` hex literals
    Intel,
    /// Microsoft assembler syntax, `h` hex literals
    Masm,
    /// AT&T syntax
    Att,
}

impl AssemblySyntax {
    /// Marker that starts a comment line in this syntax
    pub fn comment_prefix(self) -> &'static str {
        match self {
            AssemblySyntax::Intel | AssemblySyntax::Masm => ";",
            AssemblySyntax::Att => "#",
        }
    }
}

impl fmt::Display for AssemblySyntax {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssemblySyntax::Intel => write!(f, "intel"),
            AssemblySyntax::Masm => write!(f, "masm"),
            AssemblySyntax::Att => write!(f, "att"),
        }
    }
}

thread_local! {
    // Capstone handles are not Sync; each worker thread builds its own
    static CS_POOL: RefCell<HashMap<(Bitness, AssemblySyntax), Rc<Capstone>>> =
        RefCell::new(HashMap::new());
}

/// x86/x64 decoder backed by Capstone.
#[derive(Debug, Clone, Copy)]
pub struct CapstoneDecoder {
    bitness: Bitness,
    syntax: AssemblySyntax,
}

impl CapstoneDecoder {
    /// Create a decoder for `bitness` code rendered in `syntax`
    pub fn new(bitness: Bitness, syntax: AssemblySyntax) -> Self {
        Self { bitness, syntax }
    }

    pub fn syntax(&self) -> AssemblySyntax {
        self.syntax
    }

    /// Build a Capstone handle with operand detail enabled
    pub fn build(bitness: Bitness, syntax: AssemblySyntax) -> Result<Capstone, DecoderError> {
        let mode = match bitness {
            Bitness::Bits32 => arch::x86::ArchMode::Mode32,
            Bitness::Bits64 => arch::x86::ArchMode::Mode64,
        };
        let mut cs = Capstone::new().x86().mode(mode).detail(true).build()?;
        cs.set_syntax(match syntax {
            AssemblySyntax::Intel => capstone::Syntax::Intel,
            AssemblySyntax::Masm => capstone::Syntax::Masm,
            AssemblySyntax::Att => capstone::Syntax::Att,
        })?;
        Ok(cs)
    }

    /// This thread's handle for our mode and syntax
    fn handle(&self) -> Result<Rc<Capstone>, DecoderError> {
        CS_POOL.with(|cell| {
            let mut pool = cell.borrow_mut();
            let key = (self.bitness, self.syntax);
            if let Some(cs) = pool.get(&key) {
                return Ok(cs.clone());
            }
            let cs = Rc::new(Self::build(self.bitness, self.syntax)?);
            pool.insert(key, cs.clone());
            Ok(cs)
        })
    }

    fn convert(&self, cs: &Capstone, raw: &capstone::Insn<'_>) -> Result<Insn, DecoderError> {
        let addr = raw.address();
        let detail = cs.insn_detail(raw)?;
        let arch_detail = detail.arch_detail();
        let x86 = arch_detail.x86().ok_or(DecoderError::MissingDetail(addr))?;

        let mut raw_ops: Vec<_> = x86.operands().collect();
        // AT&T detail lists operands source first; keep the IR in Intel order
        if self.syntax == AssemblySyntax::Att {
            raw_ops.reverse();
        }

        let mnemonic = raw.mnemonic().unwrap_or("").to_string();
        let flow = flow_control(&mnemonic, raw_ops.first().map(|op| &op.op_type));
        let bytes = raw.bytes();
        let len = raw.len();
        let branch_immediates = matches!(
            flow,
            FlowControl::UnconditionalBranch | FlowControl::ConditionalBranch | FlowControl::Call
        ) || base_mnemonic(&mnemonic) == "xbegin";

        let ops = match far_branch(&raw_ops) {
            Some(far) if branch_immediates => vec![far],
            _ => raw_ops
                .iter()
                .filter_map(|op| {
                    let size = MemorySize::from_bytes(op.size);
                    let kind = match &op.op_type {
                        X86OperandType::Reg(reg) => {
                            OperandKind::Register(cs.reg_name(*reg).unwrap_or_default())
                        }
                        X86OperandType::Imm(value) if branch_immediates => {
                            OperandKind::NearBranch(*value as u64 & self.bitness.mask())
                        }
                        X86OperandType::Imm(value) => {
                            let value = *value as u64 & width_mask(op.size);
                            OperandKind::Immediate {
                                value,
                                size: immediate_size(bytes, value, op.size),
                            }
                        }
                        X86OperandType::Mem(mem) => {
                            OperandKind::Memory(self.memory_operand(cs, mem, addr, len))
                        }
                        _ => return None,
                    };
                    Some(Operand::new(kind, size))
                })
                .collect(),
        };

        Ok(Insn {
            addr,
            size: len as u8,
            mnemonic,
            operands: raw.op_str().unwrap_or("").to_string(),
            flow,
            ops,
        })
    }

    fn memory_operand(&self, cs: &Capstone, mem: &X86OpMem, addr: Address, len: usize) -> MemoryOperand {
        let base = mem.base();
        let index = mem.index();
        let disp = mem.disp();

        if base.0 == X86Reg::X86_REG_RIP as u16 || base.0 == X86Reg::X86_REG_EIP as u16 {
            let target = (addr as i64).wrapping_add(len as i64).wrapping_add(disp) as u64;
            return MemoryOperand {
                base: None,
                index: None,
                scale: 1,
                displacement: target & self.bitness.mask(),
                displacement_size: self.bitness.address_bytes(),
                ip_relative: true,
            };
        }

        let register = |reg: RegId| (reg.0 != 0).then(|| cs.reg_name(reg)).flatten();
        let base = register(base);
        let index = register(index);
        let displacement_size = if base.is_none() && index.is_none() {
            if i32::try_from(disp).is_ok() || self.bitness == Bitness::Bits32 {
                4
            } else {
                8
            }
        } else if disp == 0 {
            0
        } else if i8::try_from(disp).is_ok() {
            1
        } else {
            4
        };

        MemoryOperand {
            base,
            index,
            scale: mem.scale() as u8,
            displacement: disp as u64 & width_mask(displacement_size),
            displacement_size,
            ip_relative: false,
        }
    }
}

/// Direct far `jmp`/`call`: selector and offset immediates.
fn far_branch(ops: &[capstone::arch::x86::X86Operand]) -> Option<Operand> {
    match ops {
        [first, second] => match (&first.op_type, &second.op_type) {
            (X86OperandType::Imm(selector), X86OperandType::Imm(offset)) => Some(Operand::new(
                OperandKind::FarBranch {
                    selector: *selector as u16,
                    offset: *offset as u32,
                },
                MemorySize::Unknown,
            )),
            _ => None,
        },
        _ => None,
    }
}

fn width_mask(bytes: u8) -> u64 {
    match bytes {
        1 => 0xff,
        2 => 0xffff,
        4 => 0xffff_ffff,
        _ => u64::MAX,
    }
}

/// Encoded width of an immediate. Immediates are the trailing bytes of
/// their instruction, so the narrowest suffix that sign-extends to `value`
/// is the encoding.
fn immediate_size(bytes: &[u8], value: u64, op_size: u8) -> ImmediateSize {
    let encoded = [1usize, 2, 4, 8].into_iter().find(|&width| {
        bytes.len() > width && {
            let tail = &bytes[bytes.len() - width..];
            let mut raw = [0u8; 8];
            raw[..width].copy_from_slice(tail);
            let shift = 64 - 8 * width as u32;
            let extended = ((u64::from_le_bytes(raw) << shift) as i64 >> shift) as u64;
            extended & width_mask(op_size) == value
        }
    });

    match (encoded, op_size) {
        (Some(1), 1) => ImmediateSize::Imm8,
        (Some(1), 2) => ImmediateSize::Imm8to16,
        (Some(1), 4) => ImmediateSize::Imm8to32,
        (Some(1), _) => ImmediateSize::Imm8to64,
        (Some(2), _) => ImmediateSize::Imm16,
        (Some(4), 8) => ImmediateSize::Imm32to64,
        (Some(4), _) => ImmediateSize::Imm32,
        (Some(_), _) => ImmediateSize::Imm64,
        (None, 1) => ImmediateSize::Imm8,
        (None, 2) => ImmediateSize::Imm16,
        (None, 8) => ImmediateSize::Imm32to64,
        (None, _) => ImmediateSize::Imm32,
    }
}

/// Flow-control class from the mnemonic and the shape of the first operand.
fn flow_control(mnemonic: &str, first: Option<&X86OperandType>) -> FlowControl {
    let direct = matches!(first, Some(X86OperandType::Imm(_)));
    match strip_size_suffix(base_mnemonic(mnemonic)) {
        "" => FlowControl::Unclassified,
        "jmp" | "ljmp" if direct => FlowControl::UnconditionalBranch,
        "jmp" | "ljmp" => FlowControl::IndirectBranch,
        "call" | "lcall" if direct => FlowControl::Call,
        "call" | "lcall" => FlowControl::IndirectCall,
        "ret" | "retf" | "lret" | "iret" | "iretd" | "iretq" | "sysret" | "sysexit" => {
            FlowControl::Return
        }
        "int" | "int1" | "int3" | "into" | "syscall" | "sysenter" => FlowControl::Interrupt,
        "ud0" | "ud1" | "ud2" => FlowControl::Exception,
        "xbegin" | "xabort" | "xend" => FlowControl::XbeginXabortXend,
        m if m.starts_with('j') || m.starts_with("loop") => FlowControl::ConditionalBranch,
        _ => FlowControl::Next,
    }
}

/// `callq` -> `call`, `lretl` -> `lret`, and so on.
fn strip_size_suffix(mnemonic: &str) -> &str {
    const ROOTS: [&str; 9] = [
        "call", "jmp", "ret", "lcall", "ljmp", "lret", "sysret", "sysexit", "ud1",
    ];
    for root in ROOTS {
        if let Some(rest) = mnemonic.strip_prefix(root) {
            if matches!(rest, "w" | "l" | "q") {
                return root;
            }
        }
    }
    mnemonic
}

/// One-byte pseudo-instruction for bytes Capstone cannot decode.
fn data_byte(addr: Address, byte: u8, syntax: AssemblySyntax) -> Insn {
    let (mnemonic, operands) = match syntax {
        AssemblySyntax::Intel => ("db", format!("0x{:02x}", byte)),
        AssemblySyntax::Masm => ("db", format!("0{:02X}h", byte)),
        AssemblySyntax::Att => (".byte", format!("0x{:02x}", byte)),
    };
    Insn {
        addr,
        size: 1,
        mnemonic: mnemonic.to_string(),
        operands,
        flow: FlowControl::Next,
        ops: Vec::new(),
    }
}

impl Decoder for CapstoneDecoder {
    fn bitness(&self) -> Bitness {
        self.bitness
    }

    fn comment_prefix(&self) -> &'static str {
        self.syntax.comment_prefix()
    }

    fn decode(&self, code: &[u8], address: Address) -> Result<Vec<Insn>, DisassemblyError> {
        let cs = self.handle()?;
        let mut insns = Vec::new();
        let mut offset = 0usize;

        while offset < code.len() {
            let at = address + offset as Address;
            let decoded = cs.disasm_all(&code[offset..], at).map_err(DecoderError::from)?;
            for raw in decoded.iter() {
                insns.push(self.convert(&cs, &raw)?);
                offset += raw.len();
            }

            // Capstone stops at the first byte it cannot decode
            if offset < code.len() {
                let at = address + offset as Address;
                log::warn!("Undecodable byte 0x{:02x} at 0x{:x}", code[offset], at);
                insns.push(data_byte(at, code[offset], self.syntax));
                offset += 1;
            }
        }

        Ok(insns)
    }

    fn format(
        &self,
        insn: &Insn,
        resolve: &mut dyn FnMut(&SymbolQuery<'_>) -> Option<SymbolResult>,
    ) -> String {
        let mut operands = insn.operands.clone();

        for query in SymbolQuery::operands(insn, self.bitness) {
            let Some(symbol) = resolve(&query) else {
                continue;
            };
            match substitute(&operands, &query, &symbol, self.syntax) {
                Some(text) => operands = text,
                None => log::trace!(
                    "No literal for 0x{:x} in \"{}\" at 0x{:x}",
                    query.address,
                    operands,
                    insn.addr
                ),
            }
        }

        if operands.is_empty() {
            insn.mnemonic.clone()
        } else {
            format!("{} {}", insn.mnemonic, operands)
        }
    }
}

/// Replace the literal of one operand in `text` with the resolved name.
///
/// Only the operand's own part of the text is searched, so an equal literal
/// in another operand is left alone.
fn substitute(
    text: &str,
    query: &SymbolQuery<'_>,
    symbol: &SymbolResult,
    syntax: AssemblySyntax,
) -> Option<String> {
    let (start, end) = operand_span(text, query, syntax);
    let span = &text[start..end];

    let replaced = match query.operand_kind()? {
        OperandKind::Memory(mem) if mem.ip_relative => match syntax {
            AssemblySyntax::Att => replace_rip_att(span, &symbol.text),
            _ => replace_rip_bracket(span, &symbol.text),
        },
        OperandKind::Memory(mem) => replace_literal(span, mem.unsigned_displacement(), &symbol.text)
            .or_else(|| {
                replace_literal(span, mem.signed_displacement().unsigned_abs(), &symbol.text)
            }),
        OperandKind::FarBranch { offset, .. } => replace_literal(span, *offset as u64, &symbol.text),
        OperandKind::Immediate { value, .. } => replace_literal(span, query.address, &symbol.text)
            .or_else(|| replace_literal(span, *value, &symbol.text)),
        _ => replace_literal(span, query.address, &symbol.text),
    }?;
    let replaced = format!("{}{}{}", &text[..start], replaced, &text[end..]);

    let keyword = symbol.display_size.and_then(MemorySize::keyword);
    match keyword {
        Some(keyword) if syntax != AssemblySyntax::Att => Some(set_ptr_size(&replaced, keyword)),
        _ => Some(replaced),
    }
}

/// Byte range of the queried operand in `text`. Falls back to the whole
/// text when the comma-separated parts do not line up with the operands.
fn operand_span(text: &str, query: &SymbolQuery<'_>, syntax: AssemblySyntax) -> (usize, usize) {
    let spans = operand_spans(text);
    let count = query.insn.ops.len();
    if spans.len() != count || query.operand >= count {
        return (0, text.len());
    }
    // AT&T text lists the operands in reverse of the IR order
    let index = match syntax {
        AssemblySyntax::Att => count - 1 - query.operand,
        _ => query.operand,
    };
    spans[index]
}

/// Top-level comma-separated parts of an operand list.
fn operand_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match c {
            '[' | '(' => depth += 1,
            ']' | ')' => depth -= 1,
            ',' if depth == 0 => {
                spans.push((start, i));
                start = i + 1;
            }
            _ => {}
        }
    }
    if !text.is_empty() {
        spans.push((start, text.len()));
    }
    spans
}

/// Spellings Capstone uses for `value` across the three syntaxes.
fn literal_forms(value: u64) -> Vec<String> {
    let mut forms = vec![
        format!("0x{:x}", value),
        format!("0{:x}h", value),
        format!("{:x}h", value),
    ];
    if value < 10 {
        forms.push(value.to_string());
    }
    forms
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Byte offset of `token` in `text` as a whole word, ignoring case.
fn find_token(text: &str, token: &str) -> Option<usize> {
    let lower = text.to_ascii_lowercase();
    let bytes = lower.as_bytes();
    lower.match_indices(token).map(|(start, _)| start).find(|&start| {
        let end = start + token.len();
        (start == 0 || !is_word_byte(bytes[start - 1])) && (end == bytes.len() || !is_word_byte(bytes[end]))
    })
}

fn replace_literal(text: &str, value: u64, replacement: &str) -> Option<String> {
    literal_forms(value).into_iter().find_map(|form| {
        let start = find_token(text, &form)?;
        Some(format!("{}{}{}", &text[..start], replacement, &text[start + form.len()..]))
    })
}

/// `[rip + 0x1234]` -> `[name]`
fn replace_rip_bracket(text: &str, replacement: &str) -> Option<String> {
    let mut from = 0;
    while let Some(open) = text[from..].find('[').map(|i| from + i) {
        let close = open + text[open..].find(']')?;
        let inner = &text[open + 1..close];
        if find_token(inner, "rip").is_some() || find_token(inner, "eip").is_some() {
            return Some(format!("{}[{}]{}", &text[..open], replacement, &text[close + 1..]));
        }
        from = close + 1;
    }
    None
}

/// `0x1234(%rip)` -> `name(%rip)`
fn replace_rip_att(text: &str, replacement: &str) -> Option<String> {
    let paren = text.find("(%rip)").or_else(|| text.find("(%eip)"))?;
    let start = text[..paren]
        .rfind(|c: char| !(c.is_ascii_alphanumeric() || c == '-'))
        .map_or(0, |i| i + 1);
    Some(format!("{}{}{}", &text[..start], replacement, &text[paren..]))
}

/// Rewrite (or add) the `<size> ptr` keyword of the memory operand.
fn set_ptr_size(text: &str, keyword: &str) -> String {
    if let Some(ptr) = find_token(text, "ptr") {
        let head = text[..ptr].trim_end();
        let word_start = head.rfind([' ', ',']).map_or(0, |i| i + 1);
        format!("{}{} {}", &text[..word_start], keyword, &text[ptr..])
    } else if let Some(open) = text.find('[') {
        format!("{}{} ptr {}", &text[..open], keyword, &text[open..])
    } else {
        text.to_string()
    }
}
