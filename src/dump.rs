//! Method dump files
//!
//! A dump is a JSON snapshot of compiled methods taken from a running
//! process: their code bytes, IL-to-native maps and sequence points, plus the
//! runtime symbols (helpers, method tables, other methods) their code refers
//! to. It stands in for the live process as byte, symbol and source provider.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::source::{SequencePoint, HIDDEN_LINE};
use crate::{
    Address, Bitness, CodeRegion, CodeRegions, DisassemblyError, MethodSymbol, NativeMethod,
    OffsetMapping, SourceMapper, SymbolProvider,
};

/// Parsed dump file.
#[derive(Debug, Clone, Deserialize)]
pub struct DumpFile {
    /// 32 or 64
    pub bitness: u32,
    #[serde(default)]
    pub methods: Vec<MethodDump>,
    #[serde(default)]
    pub symbols: Vec<SymbolDump>,
    /// Directory the dump was loaded from
    #[serde(skip)]
    pub origin: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MethodDump {
    pub name: String,
    #[serde(default)]
    pub token: Option<u32>,
    pub regions: Vec<RegionDump>,
    #[serde(default)]
    pub offset_map: Vec<OffsetMapping>,
    #[serde(default)]
    pub sequence_points: Vec<SequencePointDump>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegionDump {
    pub address: Address,
    /// Hex-encoded code bytes
    pub bytes: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SequencePointDump {
    pub il_offset: u32,
    pub file: PathBuf,
    pub start_line: u32,
    pub start_column: u32,
    pub end_line: u32,
    pub end_column: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolDumpKind {
    Helper,
    MethodTable,
    Method,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SymbolDump {
    pub address: Address,
    pub name: String,
    pub kind: SymbolDumpKind,
    /// Code extents, for `method` symbols
    #[serde(default)]
    pub code: Vec<ExtentDump>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ExtentDump {
    pub address: Address,
    pub length: u64,
}

impl DumpFile {
    /// Load a dump from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DisassemblyError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let mut dump = Self::parse(&text)?;
        dump.origin = path.parent().map(Path::to_path_buf);
        log::debug!(
            "Loaded {} methods and {} symbols from {}",
            dump.methods.len(),
            dump.symbols.len(),
            path.display()
        );
        Ok(dump)
    }

    /// Parse a dump from JSON text
    pub fn parse(text: &str) -> Result<Self, DisassemblyError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn bitness(&self) -> Result<Bitness, DisassemblyError> {
        Bitness::from_bits(self.bitness)
            .ok_or_else(|| DisassemblyError::DumpError(format!("unsupported bitness {}", self.bitness)))
    }

    /// Every method, with regions decoded and validated
    pub fn methods(&self) -> Result<Vec<NativeMethod>, DisassemblyError> {
        self.methods.iter().map(MethodDump::to_native).collect()
    }

    /// Symbol provider over the dump's symbol table
    pub fn symbols(&self) -> DumpSymbols {
        DumpSymbols::new(&self.symbols)
    }

    /// Source mapper over the dump's sequence points. Relative source paths
    /// resolve against `root`, or the dump's own directory.
    pub fn sources(&self, root: Option<&Path>) -> DumpSources {
        let root = root.map(Path::to_path_buf).or_else(|| self.origin.clone());
        DumpSources::new(&self.methods, root)
    }
}

impl MethodDump {
    pub fn to_native(&self) -> Result<NativeMethod, DisassemblyError> {
        let regions = self
            .regions
            .iter()
            .map(|region| {
                let bytes = hex::decode(region.bytes.trim()).map_err(|e| {
                    DisassemblyError::DumpError(format!(
                        "{}: region at 0x{:x}: {}",
                        self.name, region.address, e
                    ))
                })?;
                Ok(CodeRegion::new(region.address, bytes))
            })
            .collect::<Result<Vec<_>, DisassemblyError>>()?;

        Ok(NativeMethod::new(
            self.name.clone(),
            self.token,
            CodeRegions::new(regions)?,
            self.offset_map.clone(),
        ))
    }
}

/// Runtime symbols recorded in a dump.
#[derive(Debug, Clone, Default)]
pub struct DumpSymbols {
    helpers: HashMap<Address, String>,
    method_tables: HashMap<Address, String>,
    /// Keyed by the start of the method's first extent
    methods: BTreeMap<Address, MethodSymbol>,
}

impl DumpSymbols {
    pub fn new(symbols: &[SymbolDump]) -> Self {
        let mut table = Self::default();
        for symbol in symbols {
            match symbol.kind {
                SymbolDumpKind::Helper => {
                    table.helpers.insert(symbol.address, symbol.name.clone());
                }
                SymbolDumpKind::MethodTable => {
                    table.method_tables.insert(symbol.address, symbol.name.clone());
                }
                SymbolDumpKind::Method => {
                    let code: Vec<(Address, u64)> =
                        symbol.code.iter().map(|e| (e.address, e.length)).collect();
                    let start = code.first().map_or(symbol.address, |&(start, _)| start);
                    table.methods.insert(
                        start,
                        MethodSymbol {
                            name: symbol.name.clone(),
                            code,
                        },
                    );
                }
            }
        }
        table
    }
}

impl SymbolProvider for DumpSymbols {
    fn helper_name(&self, address: Address) -> Option<String> {
        self.helpers.get(&address).cloned()
    }

    fn method_table_name(&self, address: Address) -> Option<String> {
        self.method_tables.get(&address).cloned()
    }

    fn method_at(&self, address: Address) -> Option<MethodSymbol> {
        self.methods
            .range(..=address)
            .next_back()
            .map(|(_, method)| method.clone())
    }
}

/// Sequence points recorded in a dump, per method.
#[derive(Debug, Clone, Default)]
pub struct DumpSources {
    root: Option<PathBuf>,
    /// Keyed by method name and lowest code address. Sorted by IL offset,
    /// hidden points removed.
    points: HashMap<(String, Option<Address>), Vec<SequencePointDump>>,
}

impl DumpSources {
    pub fn new(methods: &[MethodDump], root: Option<PathBuf>) -> Self {
        let points = methods
            .iter()
            .filter(|m| !m.sequence_points.is_empty())
            .map(|m| {
                let mut points: Vec<SequencePointDump> = m
                    .sequence_points
                    .iter()
                    .filter(|p| p.start_line != HIDDEN_LINE)
                    .cloned()
                    .collect();
                points.sort_by_key(|p| p.il_offset);
                let start = m.regions.iter().map(|r| r.address).min();
                ((m.name.clone(), start), points)
            })
            .collect();
        Self { root, points }
    }

    fn resolve_path(&self, file: &Path) -> PathBuf {
        match &self.root {
            Some(root) if file.is_relative() => root.join(file),
            _ => file.to_path_buf(),
        }
    }
}

impl SourceMapper for DumpSources {
    fn sequence_point(&self, method: &NativeMethod, il_offset: u32) -> Option<SequencePoint> {
        let start = method.regions.iter().next().map(|r| r.address);
        let points = self.points.get(&(method.name.clone(), start))?;
        let index = points.partition_point(|p| p.il_offset <= il_offset);
        let point = points.get(index.checked_sub(1)?)?;

        Some(SequencePoint {
            file: self.resolve_path(&point.file),
            start_line: point.start_line,
            start_column: point.start_column,
            end_line: point.end_line,
            end_column: point.end_column,
        })
    }
}
