//! JSON and JSON Lines output formatters

use serde::Serialize;

use super::DisassemblyFormatter;
use crate::render::{Listing, ListingLine};
use crate::DisassemblyError;

/// Serializable listing for JSON output
#[derive(Serialize)]
struct ListingJson<'a> {
    /// Fully-qualified method name
    method: &'a str,
    /// Total code size in bytes
    code_size: u64,
    bitness: u32,
    lines: Vec<LineJson<'a>>,
}

/// Serializable listing line, tagged by `kind`
#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum LineJson<'a> {
    Blank,
    Label {
        name: &'a str,
    },
    Source {
        text: &'a str,
        /// `[start, end)` display columns of a partial statement
        #[serde(skip_serializing_if = "Option::is_none")]
        highlight: Option<[usize; 2]>,
    },
    Instruction {
        /// Address as `0x` hex, omitted when hidden
        #[serde(skip_serializing_if = "Option::is_none")]
        address: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        bytes: Option<&'a str>,
        text: &'a str,
    },
}

/// Convert a listing to its JSON view
fn listing_to_json(listing: &Listing) -> ListingJson<'_> {
    ListingJson {
        method: &listing.method,
        code_size: listing.code_size,
        bitness: listing.bitness,
        lines: listing.lines.iter().map(line_to_json).collect(),
    }
}

fn line_to_json(line: &ListingLine) -> LineJson<'_> {
    match line {
        ListingLine::Blank => LineJson::Blank,
        ListingLine::Label { name } => LineJson::Label { name },
        ListingLine::Source(statement) => LineJson::Source {
            text: &statement.text,
            highlight: statement
                .is_partial
                .then_some([statement.highlight_start, statement.highlight_end]),
        },
        ListingLine::Instruction { address, bytes, text } => LineJson::Instruction {
            address: address.map(|addr| format!("0x{:x}", addr)),
            bytes: bytes.as_deref(),
            text,
        },
    }
}

impl DisassemblyFormatter for super::JsonFormatter {
    fn format(&self, listing: &Listing) -> Result<String, DisassemblyError> {
        let mut output = serde_json::to_string_pretty(&listing_to_json(listing))?;
        output.push('\n');
        Ok(output)
    }
}

impl DisassemblyFormatter for super::JsonLinesFormatter {
    fn format(&self, listing: &Listing) -> Result<String, DisassemblyError> {
        let mut output = serde_json::to_string(&listing_to_json(listing))?;
        output.push('\n');
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{JsonFormatter, JsonLinesFormatter};
    use crate::source::SourceStatement;
    use serde_json::{json, Value};

    fn listing() -> Listing {
        Listing {
            method: "M".to_string(),
            code_size: 1,
            bitness: 64,
            comment_prefix: ";",
            lines: vec![
                ListingLine::Blank,
                ListingLine::Label { name: "LBL_0".to_string() },
                ListingLine::Source(SourceStatement {
                    text: "return;".to_string(),
                    highlight_start: 0,
                    highlight_end: 7,
                    is_partial: false,
                }),
                ListingLine::Instruction {
                    address: Some(0x1000),
                    bytes: Some("C3".to_string()),
                    text: "ret".to_string(),
                },
                ListingLine::Instruction { address: None, bytes: None, text: "int3".to_string() },
            ],
        }
    }

    #[test]
    fn test_json_lines_tagged_by_kind() {
        let output = JsonFormatter.format(&listing()).unwrap();
        let value: Value = serde_json::from_str(&output).unwrap();

        assert_eq!(value["method"], "M");
        assert_eq!(value["bitness"], 64);
        assert_eq!(
            value["lines"],
            json!([
                { "kind": "blank" },
                { "kind": "label", "name": "LBL_0" },
                { "kind": "source", "text": "return;" },
                { "kind": "instruction", "address": "0x1000", "bytes": "C3", "text": "ret" },
                { "kind": "instruction", "text": "int3" },
            ])
        );
    }

    #[test]
    fn test_json_lines_single_line() {
        let output = JsonLinesFormatter.format(&listing()).unwrap();

        assert_eq!(output.lines().count(), 1);
        assert!(output.ends_with('\n'));
    }
}
