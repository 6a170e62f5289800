//! Symbol resolution for operand addresses
//!
//! A [`SymbolResolver`] answers "what should this address be called" by trying
//! a fixed chain of strategies, first match wins:
//!
//! 1. the local label assigned to the address by the label pass,
//! 2. a runtime symbol from the shared [`SymbolCache`],
//! 3. the diffable placeholder, when diffable output is on and the operand
//!    looks like an address,
//!
//! and otherwise leaves the operand as a raw literal.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::analysis::{AddressKind, AddressTable};
use crate::diffable::{DiffableRewriter, DIFFABLE_PLACEHOLDER};
use crate::{Address, Bitness, ImmediateSize, Insn, MemorySize, OperandKind, SymbolProvider};

/// What a runtime symbol refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolKind {
    /// A runtime helper routine
    Helper,
    /// A type's method table
    MethodTable,
    /// Another compiled method
    Method,
}

/// A runtime symbol resolved from the symbol provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownSymbol {
    pub address: Address,
    pub name: String,
    pub kind: SymbolKind,
}

/// Extra facts about where a looked-up address came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LookupContext {
    /// The address is the memory operand of a `call`/`jmp` through memory,
    /// so it must reference code and may be matched to any method.
    pub any_data_is_method: bool,
}

/// Runtime symbols shared by every method rendered from one process snapshot.
///
/// Each address is resolved at most once; failures are cached too and never
/// retried.
#[derive(Debug, Default)]
pub struct SymbolCache {
    known: Mutex<HashMap<Address, Option<KnownSymbol>>>,
}

impl SymbolCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached symbol for `address`, if it resolved.
    pub fn get(&self, address: Address) -> Option<KnownSymbol> {
        self.known.lock().get(&address).cloned().flatten()
    }

    /// Whether `address` has been looked up, successfully or not.
    pub fn is_cached(&self, address: Address) -> bool {
        self.known.lock().contains_key(&address)
    }

    /// Number of cached addresses, failures included.
    pub fn len(&self) -> usize {
        self.known.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.lock().is_empty()
    }

    /// Look `address` up, asking `provider` only on the first request.
    pub fn resolve(
        &self,
        address: Address,
        context: LookupContext,
        provider: &dyn SymbolProvider,
    ) -> Option<KnownSymbol> {
        // Held across the provider call so two threads never resolve the same address
        let mut known = self.known.lock();
        if let Some(cached) = known.get(&address) {
            return cached.clone();
        }

        let resolved = resolve_external(address, context, provider);
        known.insert(address, resolved.clone());
        resolved
    }

    /// Resolve every operand address of `insns` that has no local label.
    pub fn populate(
        &self,
        insns: &[Insn],
        labels: &AddressTable,
        bitness: Bitness,
        provider: &dyn SymbolProvider,
    ) {
        let before = self.len();

        for insn in insns {
            let through_memory = insn.is_memory_call_or_jump();
            for query in SymbolQuery::operands(insn, bitness) {
                if labels.name(query.address).is_some() {
                    continue;
                }
                let context = LookupContext {
                    any_data_is_method: through_memory
                        && matches!(query.operand_kind(), Some(OperandKind::Memory(_))),
                };
                self.resolve(query.address, context, provider);
            }
        }

        log::debug!(
            "Symbol cache grew from {} to {} addresses",
            before,
            self.len()
        );
    }
}

/// Helpers first, then method tables, then compiled methods.
fn resolve_external(
    address: Address,
    context: LookupContext,
    provider: &dyn SymbolProvider,
) -> Option<KnownSymbol> {
    if let Some(name) = provider.helper_name(address) {
        return Some(KnownSymbol { address, name, kind: SymbolKind::Helper });
    }

    if let Some(name) = provider.method_table_name(address) {
        return Some(KnownSymbol {
            address,
            name: format!("methodtable({})", name),
            kind: SymbolKind::MethodTable,
        });
    }

    let method = provider.method_at(address)?;
    // Addresses past the end of the method's code are usually trailing data
    if context.any_data_is_method || method.code_contains(address) {
        return Some(KnownSymbol { address, name: method.name, kind: SymbolKind::Method });
    }

    log::trace!(
        "Rejected {} for 0x{:x}: address is outside its code",
        method.name,
        address
    );
    None
}

/// One address-bearing operand offered to the resolver.
#[derive(Debug, Clone, Copy)]
pub struct SymbolQuery<'a> {
    pub insn: &'a Insn,
    /// Index into `insn.ops`
    pub operand: usize,
    pub address: Address,
    /// Width of the address as encoded, in bytes
    pub address_size: u8,
}

impl<'a> SymbolQuery<'a> {
    /// A query for every operand of `insn` that can hold an address.
    ///
    /// Registers, 8/16-bit immediates and short displacements never can.
    pub fn operands(insn: &'a Insn, bitness: Bitness) -> Vec<SymbolQuery<'a>> {
        insn.ops
            .iter()
            .enumerate()
            .filter_map(|(operand, op)| {
                let (address, address_size) = match &op.kind {
                    OperandKind::Register(_) => return None,
                    OperandKind::NearBranch(target) => (*target, bitness.address_bytes()),
                    OperandKind::FarBranch { offset, .. } => (*offset as u64, 4),
                    OperandKind::Immediate { value, size } => match size {
                        ImmediateSize::Imm32 => (*value & bitness.mask(), 4),
                        ImmediateSize::Imm64 | ImmediateSize::Imm32to64 => {
                            (*value & bitness.mask(), 8)
                        }
                        _ => return None,
                    },
                    OperandKind::Memory(mem) if mem.ip_relative => {
                        (mem.displacement & bitness.mask(), bitness.address_bytes())
                    }
                    OperandKind::Memory(mem) if mem.displacement_size >= 4 => (
                        mem.signed_displacement() as u64 & bitness.mask(),
                        mem.displacement_size,
                    ),
                    OperandKind::Memory(_) => return None,
                };
                Some(SymbolQuery { insn, operand, address, address_size })
            })
            .collect()
    }

    /// The operand this query is about.
    pub fn operand_kind(&self) -> Option<&'a OperandKind> {
        self.insn.ops.get(self.operand).map(|op| &op.kind)
    }
}

/// Where a resolved name came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolSource {
    Label,
    Function,
    Runtime(SymbolKind),
    Placeholder,
}

/// The name to print for an operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolResult {
    pub text: String,
    pub source: SymbolSource,
    /// Operand size the formatter should print, when it must change
    pub display_size: Option<MemorySize>,
}

impl SymbolResult {
    pub fn new(text: impl Into<String>, source: SymbolSource) -> Self {
        Self {
            text: text.into(),
            source,
            display_size: None,
        }
    }
}

type Strategy = fn(&SymbolResolver<'_>, &SymbolQuery<'_>) -> Option<SymbolResult>;

/// Resolution order; the first strategy with an answer wins.
const CHAIN: [Strategy; 3] = [local_label, cached_symbol, diffable_placeholder];

/// Per-method resolver handed to the instruction formatter.
pub struct SymbolResolver<'a> {
    labels: &'a AddressTable,
    cache: &'a SymbolCache,
    diffable: Option<&'a DiffableRewriter>,
}

impl<'a> SymbolResolver<'a> {
    pub fn new(
        labels: &'a AddressTable,
        cache: &'a SymbolCache,
        diffable: Option<&'a DiffableRewriter>,
    ) -> Self {
        Self { labels, cache, diffable }
    }

    /// Name for the queried operand, or `None` to print the raw literal.
    pub fn resolve(&self, query: &SymbolQuery<'_>) -> Option<SymbolResult> {
        CHAIN.iter().find_map(|strategy| strategy(self, query))
    }
}

fn local_label(resolver: &SymbolResolver<'_>, query: &SymbolQuery<'_>) -> Option<SymbolResult> {
    let info = resolver.labels.get(query.address)?;
    let name = info.name.as_deref()?;
    let source = if info.kind == AddressKind::Call {
        SymbolSource::Function
    } else {
        SymbolSource::Label
    };
    Some(SymbolResult::new(name, source))
}

fn cached_symbol(resolver: &SymbolResolver<'_>, query: &SymbolQuery<'_>) -> Option<SymbolResult> {
    let symbol = resolver.cache.get(query.address)?;
    let mut result = SymbolResult::new(symbol.name, SymbolSource::Runtime(symbol.kind));

    if query.insn.is_memory_call_or_jump()
        && matches!(query.operand_kind(), Some(OperandKind::Memory(_)))
    {
        result.display_size = match query.address_size {
            4 => Some(MemorySize::Dword),
            8 => Some(MemorySize::Qword),
            _ => None,
        };
    }

    Some(result)
}

fn diffable_placeholder(
    resolver: &SymbolResolver<'_>,
    query: &SymbolQuery<'_>,
) -> Option<SymbolResult> {
    let rewriter = resolver.diffable?;
    rewriter
        .is_address_shaped(query)
        .then(|| SymbolResult::new(DIFFABLE_PLACEHOLDER, SymbolSource::Placeholder))
}
