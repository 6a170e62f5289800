//! Source statement interleaving

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{NativeMethod, SourceMapper};

/// Columns per tab stop when expanding source lines
pub const TAB_SIZE: usize = 4;

/// Line number the compiler uses for hidden sequence points
pub const HIDDEN_LINE: u32 = 0xFEEFEE;

/// A source span that compiled to a range of IL. Lines and columns are
/// 1-based; the end column is exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencePoint {
    pub file: PathBuf,
    pub start_line: u32,
    pub start_column: u32,
    pub end_line: u32,
    pub end_column: u32,
}

impl SequencePoint {
    pub fn is_hidden(&self) -> bool {
        self.start_line == HIDDEN_LINE || self.start_line == 0
    }
}

/// One physical source line of a statement, tabs already expanded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceStatement {
    pub text: String,
    /// Display column where the statement starts on this line
    pub highlight_start: usize,
    /// Display column just past the statement on this line
    pub highlight_end: usize,
    /// The statement covers only part of the line's trimmed content
    pub is_partial: bool,
}

impl SourceStatement {
    /// The statement as comment lines: the source line, plus a caret line
    /// under the highlighted span when it covers only part of the line.
    pub fn comment_lines(&self, prefix: &str) -> Vec<String> {
        let mut lines = vec![format!("{} {}", prefix, self.text)];
        if self.is_partial && self.highlight_end > self.highlight_start {
            lines.push(format!(
                "{} {}{}",
                prefix,
                " ".repeat(self.highlight_start),
                "^".repeat(self.highlight_end - self.highlight_start)
            ));
        }
        lines
    }
}

/// Source file lines shared by every method of one dump.
///
/// Keyed by path, compared case-insensitively. Files that cannot be read are
/// cached as empty.
#[derive(Debug, Default)]
pub struct SourceCache {
    files: Mutex<HashMap<String, Arc<Vec<String>>>>,
}

impl SourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lines of the file at `path`, reading it on first use.
    pub fn lines(&self, path: &Path) -> Arc<Vec<String>> {
        let key = path.to_string_lossy().to_lowercase();
        let mut files = self.files.lock();
        if let Some(lines) = files.get(&key) {
            return lines.clone();
        }

        let lines = Arc::new(read_lines(path));
        files.insert(key, lines.clone());
        lines
    }

    /// The statements `point` spans, one per non-blank line.
    pub fn statements(&self, point: &SequencePoint) -> Vec<SourceStatement> {
        if point.is_hidden() {
            return Vec::new();
        }

        let lines = self.lines(&point.file);
        let last_line = point.end_line.max(point.start_line);

        (point.start_line..=last_line)
            .filter_map(|line_no| {
                let raw = lines.get(line_no as usize - 1)?;
                let start = if line_no == point.start_line {
                    point.start_column.saturating_sub(1) as usize
                } else {
                    0
                };
                let end = if line_no == point.end_line {
                    point.end_column.saturating_sub(1) as usize
                } else {
                    usize::MAX
                };
                statement_for_line(raw, start, end)
            })
            .collect()
    }
}

fn read_lines(path: &Path) -> Vec<String> {
    match fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes)
            .trim_start_matches('\u{feff}')
            .lines()
            .map(str::to_string)
            .collect(),
        Err(e) => {
            log::debug!("Source file {} unavailable: {}", path.display(), e);
            Vec::new()
        }
    }
}

/// Cut `[start, end)` (character columns) out of one raw source line.
fn statement_for_line(raw: &str, start: usize, end: usize) -> Option<SourceStatement> {
    let chars: Vec<char> = raw.chars().collect();
    let first = chars.iter().position(|c| !c.is_whitespace())?;
    let last = chars.iter().rposition(|c| !c.is_whitespace())? + 1;

    let start = start.clamp(first, last);
    let end = end.clamp(start, last);
    let (text, columns) = expand_tabs(&chars[..last]);

    Some(SourceStatement {
        text,
        highlight_start: columns[start],
        highlight_end: columns[end],
        is_partial: start != first || end != last,
    })
}

/// Expand tabs to [`TAB_SIZE`] stops. Also returns the display column of
/// every character index, plus one entry for the end of the line.
fn expand_tabs(chars: &[char]) -> (String, Vec<usize>) {
    let mut text = String::with_capacity(chars.len());
    let mut columns = Vec::with_capacity(chars.len() + 1);
    let mut column = 0;

    for &c in chars {
        columns.push(column);
        if c == '\t' {
            let width = TAB_SIZE - column % TAB_SIZE;
            text.extend(std::iter::repeat(' ').take(width));
            column += width;
        } else {
            text.push(c);
            column += 1;
        }
    }
    columns.push(column);

    (text, columns)
}

/// Looks up the statements for a method's IL offsets.
pub struct SourceInterleaver<'a> {
    mapper: &'a dyn SourceMapper,
    cache: &'a SourceCache,
}

impl<'a> SourceInterleaver<'a> {
    pub fn new(mapper: &'a dyn SourceMapper, cache: &'a SourceCache) -> Self {
        Self { mapper, cache }
    }

    /// Statements for `il_offset` in `method`. Sentinel offsets (prolog,
    /// epilog, no mapping) have none.
    pub fn statements(&self, method: &NativeMethod, il_offset: Option<i32>) -> Vec<SourceStatement> {
        let Some(offset) = il_offset.and_then(|o| u32::try_from(o).ok()) else {
            return Vec::new();
        };

        match self.mapper.sequence_point(method, offset) {
            Some(point) => self.cache.statements(&point),
            None => Vec::new(),
        }
    }
}
