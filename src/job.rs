//! Rendering every method of a dump

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use clap::ValueEnum;
use rayon::prelude::*;

use crate::decoder::{AssemblySyntax, CapstoneDecoder};
use crate::dump::DumpFile;
use crate::format::OutputFormat;
use crate::render::{RenderOptions, Renderer};
use crate::source::SourceCache;
use crate::symbols::SymbolCache;
use crate::{DisassemblyError, NativeMethod};

/// Longest file stem written for one method
pub const MAX_FILE_STEM: usize = 200;

/// How per-method output files are named.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FilenameFormat {
    /// `Ns.Type_Method(int)_int.asm`
    MethodName,
    /// `06000001_Ns.Type_Method(int)_int.asm`
    TokenMethodName,
    /// `06000001.asm`
    Token,
}

impl fmt::Display for FilenameFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilenameFormat::MethodName => write!(f, "method-name"),
            FilenameFormat::TokenMethodName => write!(f, "token-method-name"),
            FilenameFormat::Token => write!(f, "token"),
        }
    }
}

impl FilenameFormat {
    /// Sanitised file stem for `method`
    pub fn file_stem(self, method: &NativeMethod) -> String {
        let token = format!("{:08X}", method.token.unwrap_or(0));
        let stem = match self {
            FilenameFormat::MethodName => method.name.clone(),
            FilenameFormat::TokenMethodName => format!("{}_{}", token, method.name),
            FilenameFormat::Token => token,
        };
        sanitize_file_stem(&stem)
    }
}

/// Replace characters that are illegal in file names on common file systems
/// and cap the length.
pub fn sanitize_file_stem(stem: &str) -> String {
    let sanitized: String = stem
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .take(MAX_FILE_STEM)
        .collect();
    let sanitized = sanitized.trim_end_matches(['.', ' ']);
    if sanitized.is_empty() {
        "_".to_string()
    } else {
        sanitized.to_string()
    }
}

/// Everything about a run that is not a rendering option.
#[derive(Debug, Clone)]
pub struct JobOptions {
    pub syntax: AssemblySyntax,
    pub format: OutputFormat,
    /// Write one file per method here instead of to the output stream
    pub output_dir: Option<PathBuf>,
    pub filename_format: FilenameFormat,
    /// Render only methods whose name contains one of these
    pub method_filters: Vec<String>,
    /// Base directory for relative source paths
    pub source_root: Option<PathBuf>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            syntax: AssemblySyntax::Intel,
            format: OutputFormat::Text,
            output_dir: None,
            filename_format: FilenameFormat::MethodName,
            method_filters: Vec::new(),
            source_root: None,
        }
    }
}

impl JobOptions {
    /// Whether the method filters select `name`
    pub fn selects(&self, name: &str) -> bool {
        self.method_filters.is_empty() || self.method_filters.iter().any(|f| name.contains(f.as_str()))
    }
}

/// Outcome of rendering a dump.
#[derive(Debug, Default)]
pub struct JobSummary {
    pub rendered: usize,
    /// Names of methods whose render failed
    pub failed: Vec<String>,
    /// Files written, in dump order
    pub files: Vec<PathBuf>,
}

/// Render the selected methods of `dump` in parallel.
///
/// Output goes to one file per method when `job.output_dir` is set, and to
/// `out` otherwise; either way in dump order. A method that fails to render is
/// logged and skipped.
///
/// # Arguments
/// * `dump` - The loaded dump
/// * `render` - Columns and masking options
/// * `job` - Syntax, format, filters and output destination
/// * `out` - Stream for output when no output directory is set
///
/// # Returns
/// Which methods rendered and which failed
pub fn run(
    dump: &DumpFile,
    render: RenderOptions,
    job: &JobOptions,
    out: &mut dyn Write,
) -> Result<JobSummary, DisassemblyError> {
    let bitness = dump.bitness()?;
    let methods: Vec<NativeMethod> = dump
        .methods()?
        .into_iter()
        .filter(|m| job.selects(&m.name))
        .collect();
    log::debug!("Rendering {} of {} methods", methods.len(), dump.methods.len());

    let decoder = CapstoneDecoder::new(bitness, job.syntax);
    let provider = dump.symbols();
    let mapper = dump.sources(job.source_root.as_deref());
    let symbols = SymbolCache::new();
    let sources = SourceCache::new();
    let renderer = Renderer::new(&decoder, &provider, &symbols, &sources, render).with_source_mapper(&mapper);
    let formatter = job.format.get_formatter();

    let results: Vec<Result<String, DisassemblyError>> = methods
        .par_iter()
        .map(|method| formatter.format(&renderer.render(method)?))
        .collect();

    if let Some(dir) = &job.output_dir {
        fs::create_dir_all(dir)?;
    }

    let mut summary = JobSummary::default();
    let mut used_stems = HashSet::new();
    for (method, result) in methods.iter().zip(results) {
        let text = match result {
            Ok(text) => text,
            Err(e) => {
                log::error!("Failed to render {}: {}", method.name, e);
                summary.failed.push(method.name.clone());
                continue;
            }
        };

        match &job.output_dir {
            Some(dir) => {
                let stem = unique_stem(job.filename_format.file_stem(method), &mut used_stems);
                let path = dir.join(format!("{}.{}", stem, job.format.extension()));
                fs::write(&path, text)?;
                summary.files.push(path);
            }
            None => {
                if summary.rendered > 0 && job.format == OutputFormat::Text {
                    writeln!(out)?;
                }
                out.write_all(text.as_bytes())?;
            }
        }
        summary.rendered += 1;
    }

    out.flush()?;
    Ok(summary)
}

/// `stem`, or `stem_1`, `stem_2`... if already taken
fn unique_stem(stem: String, used: &mut HashSet<String>) -> String {
    let mut candidate = stem.clone();
    let mut n = 0;
    while !used.insert(candidate.to_lowercase()) {
        n += 1;
        candidate = format!("{}_{}", stem, n);
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::regions;
    use rstest::rstest;
    use tempfile::TempDir;

    const DUMP: &str = r#"{
        "bitness": 64,
        "methods": [
            { "name": "Ns.Type:First():void", "token": 100663297,
              "regions": [{ "address": 4096, "bytes": "55C3" }] },
            { "name": "Ns.Type:Mapped():void",
              "regions": [{ "address": 8192, "bytes": "C3" }],
              "offset_map": [{ "il_offset": 0, "native_start": 8192, "native_end": 8193 }] },
            { "name": "Ns.Other:Second():void", "token": 100663299,
              "regions": [{ "address": 12288, "bytes": "90C3" }] },
            { "name": "Ns.Other:Second():void", "token": 100663300,
              "regions": [{ "address": 16384, "bytes": "C3" }] }
        ]
    }"#;

    fn method(name: &str, token: Option<u32>) -> NativeMethod {
        NativeMethod::new(name, token, regions(&[(0x1000, 1)]), vec![])
    }

    #[rstest]
    #[case(FilenameFormat::MethodName, "Ns.Type_Method(int)_int")]
    #[case(FilenameFormat::TokenMethodName, "06000001_Ns.Type_Method(int)_int")]
    #[case(FilenameFormat::Token, "06000001")]
    fn test_file_stem(#[case] format: FilenameFormat, #[case] expected: &str) {
        let method = method("Ns.Type:Method(int):int", Some(0x0600_0001));
        assert_eq!(format.file_stem(&method), expected);
    }

    #[test]
    fn test_sanitize_file_stem() {
        assert_eq!(sanitize_file_stem("List<T>:Add|x?"), "List_T__Add_x_");
        assert_eq!(sanitize_file_stem("trailing. "), "trailing");
        assert_eq!(sanitize_file_stem(""), "_");
        assert_eq!(sanitize_file_stem(&"a".repeat(500)).len(), MAX_FILE_STEM);
    }

    #[test]
    fn test_unique_stem() {
        let mut used = HashSet::new();
        assert_eq!(unique_stem("M".to_string(), &mut used), "M");
        assert_eq!(unique_stem("M".to_string(), &mut used), "M_1");
        // Names that differ only in case still collide
        assert_eq!(unique_stem("m".to_string(), &mut used), "m_2");
    }

    #[test]
    fn test_run_to_stream_in_dump_order() {
        let dump = DumpFile::parse(DUMP).unwrap();
        let job = JobOptions::default();
        let mut out = Vec::new();

        let summary = run(&dump, RenderOptions::default(), &job, &mut out).unwrap();

        assert_eq!(summary.rendered, 4);
        assert!(summary.failed.is_empty());
        let text = String::from_utf8(out).unwrap();
        let first = text.find("; Ns.Type:First():void").unwrap();
        let second = text.find("; Ns.Other:Second():void").unwrap();
        assert!(first < second);
        assert!(text.contains("0000000000001000 55                   push rbp"));
    }

    #[test]
    fn test_run_filtered_to_files() {
        let dump = DumpFile::parse(DUMP).unwrap();
        let dir = TempDir::new().unwrap();
        let job = JobOptions {
            format: OutputFormat::Json,
            output_dir: Some(dir.path().join("out")),
            method_filters: vec!["Second".to_string()],
            ..JobOptions::default()
        };
        let mut out = Vec::new();

        let summary = run(&dump, RenderOptions::default(), &job, &mut out).unwrap();

        assert!(out.is_empty());
        let names: Vec<String> = summary
            .files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec!["Ns.Other_Second()_void.json", "Ns.Other_Second()_void_1.json"]
        );
        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&summary.files[0]).unwrap()).unwrap();
        assert_eq!(json["method"], "Ns.Other:Second():void");
    }

    #[test]
    fn test_truncated_code_renders_as_data() {
        // A lone call opcode without its displacement
        let dump = DumpFile::parse(
            r#"{ "bitness": 64, "methods": [
                { "name": "Good", "regions": [{ "address": 4096, "bytes": "C3" }] },
                { "name": "Truncated", "regions": [{ "address": 8192, "bytes": "E8" }] }
            ] }"#,
        )
        .unwrap();
        let mut out = Vec::new();

        let summary = run(&dump, RenderOptions::default(), &JobOptions::default(), &mut out).unwrap();

        assert_eq!(summary.rendered, 2);
        assert!(summary.failed.is_empty());
        assert!(String::from_utf8(out).unwrap().contains("db 0xe8"));
    }

    #[test]
    fn test_selects() {
        let job = JobOptions {
            method_filters: vec!["Foo".to_string(), "Bar".to_string()],
            ..JobOptions::default()
        };
        assert!(job.selects("Ns.Foo:M()"));
        assert!(job.selects("Ns.X:Bar()"));
        assert!(!job.selects("Ns.X:Baz()"));
        assert!(JobOptions::default().selects("anything"));
    }
}
