//! Per-method listing renderer

use crate::analysis::{assign_labels, classify, AddressKind};
use crate::diffable::DiffableRewriter;
use crate::source::{SourceCache, SourceInterleaver, SourceStatement};
use crate::symbols::{SymbolCache, SymbolResolver};
use crate::{Address, Decoder, DisassemblyError, Insn, NativeMethod, SourceMapper, SymbolProvider};

/// Which parts of the listing to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderOptions {
    pub show_addresses: bool,
    pub show_bytes: bool,
    pub show_source: bool,
    /// Mask run-specific addresses; also hides the address and byte columns
    pub diffable: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            show_addresses: true,
            show_bytes: true,
            show_source: true,
            diffable: false,
        }
    }
}

impl RenderOptions {
    pub fn addresses_visible(&self) -> bool {
        self.show_addresses && !self.diffable
    }

    pub fn bytes_visible(&self) -> bool {
        self.show_bytes && !self.diffable
    }
}

/// The rendered listing of one method, independent of output format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    pub method: String,
    pub code_size: u64,
    pub bitness: u32,
    pub comment_prefix: &'static str,
    pub lines: Vec<ListingLine>,
}

/// One line of a listing, in address order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListingLine {
    /// Separates blocks
    Blank,
    Label {
        name: String,
    },
    Source(SourceStatement),
    Instruction {
        address: Option<Address>,
        /// Upper-case hex
        bytes: Option<String>,
        text: String,
    },
}

/// Renders methods against shared symbol and source caches.
pub struct Renderer<'a> {
    decoder: &'a dyn Decoder,
    provider: &'a dyn SymbolProvider,
    symbols: &'a SymbolCache,
    sources: &'a SourceCache,
    mapper: Option<&'a dyn SourceMapper>,
    options: RenderOptions,
}

impl<'a> Renderer<'a> {
    pub fn new(
        decoder: &'a dyn Decoder,
        provider: &'a dyn SymbolProvider,
        symbols: &'a SymbolCache,
        sources: &'a SourceCache,
        options: RenderOptions,
    ) -> Self {
        Self {
            decoder,
            provider,
            symbols,
            sources,
            mapper: None,
            options,
        }
    }

    /// Interleave source statements found through `mapper`
    pub fn with_source_mapper(mut self, mapper: &'a dyn SourceMapper) -> Self {
        self.mapper = Some(mapper);
        self
    }

    pub fn options(&self) -> RenderOptions {
        self.options
    }

    /// Decode every code region of `method`.
    pub fn decode(&self, method: &NativeMethod) -> Result<Vec<Insn>, DisassemblyError> {
        let mut insns = Vec::new();
        for region in method.regions.iter() {
            insns.extend(self.decoder.decode(&region.bytes, region.address)?);
        }
        Ok(insns)
    }

    /// Decode and render `method`.
    pub fn render(&self, method: &NativeMethod) -> Result<Listing, DisassemblyError> {
        let insns = self.decode(method)?;
        self.render_instructions(method, insns)
    }

    /// Render already-decoded instructions of `method`.
    ///
    /// # Arguments
    /// * `method` - The method the instructions belong to
    /// * `insns` - Its instructions, in any order
    ///
    /// # Returns
    /// The listing, or `MissingCodeRegion` if raw bytes are shown and an
    /// instruction lies outside every region
    pub fn render_instructions(
        &self,
        method: &NativeMethod,
        mut insns: Vec<Insn>,
    ) -> Result<Listing, DisassemblyError> {
        insns.sort_by_key(|insn| insn.addr);
        let bitness = self.decoder.bitness();

        let mut table = classify(&insns, &method.regions, &method.offset_map, bitness);
        assign_labels(&mut table, &method.regions);
        self.symbols.populate(&insns, &table, bitness, self.provider);

        let diffable = self.options.diffable.then(|| DiffableRewriter::new(bitness));
        let resolver = SymbolResolver::new(&table, self.symbols, diffable.as_ref());
        let interleaver = match (self.options.show_source, self.mapper) {
            (true, Some(mapper)) => Some(SourceInterleaver::new(mapper, self.sources)),
            _ => None,
        };

        let mut lines = Vec::with_capacity(insns.len() * 2);
        for insn in &insns {
            if let Some(info) = table.get(insn.addr).filter(|info| info.kind >= AddressKind::BlockStart) {
                lines.push(ListingLine::Blank);
                if let Some(name) = &info.name {
                    lines.push(ListingLine::Label { name: name.clone() });
                }
                if let Some(interleaver) = &interleaver {
                    lines.extend(
                        interleaver
                            .statements(method, info.il_offset)
                            .into_iter()
                            .map(ListingLine::Source),
                    );
                }
            }

            let bytes = if self.options.bytes_visible() {
                let raw = method.regions.bytes_at(insn.addr, insn.size as usize)?;
                Some(hex::encode_upper(raw))
            } else {
                None
            };

            lines.push(ListingLine::Instruction {
                address: self.options.addresses_visible().then_some(insn.addr),
                bytes,
                text: self.decoder.format(insn, &mut |query| resolver.resolve(query)),
            });
        }

        log::debug!("Rendered {} ({} lines)", method.name, lines.len());

        Ok(Listing {
            method: method.name.clone(),
            code_size: method.code_size(),
            bitness: bitness.bits(),
            comment_prefix: self.decoder.comment_prefix(),
            lines,
        })
    }
}
