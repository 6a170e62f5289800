//! Output format module implementation

mod json;

pub use self::json::*;

use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;

use crate::render::{Listing, ListingLine};
use crate::DisassemblyError;

/// Width of the separator rule in the text header
pub const SEPARATOR_WIDTH: usize = 80;

/// Number of instruction bytes the byte column has room for
pub const BYTES_COLUMN_WIDTH: usize = 10;

/// Printed in place of the address column when addresses are hidden
pub const HIDDEN_ADDRESS_COLUMN: &str = "    ";

/// Supported output formats for listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Plain text assembly listing (default)
    Text,
    /// JSON format (one document per method)
    Json,
    /// JSON Lines format (one JSON object per method, one per line)
    JsonLines,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::JsonLines => write!(f, "jsonl"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "asm" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "jsonl" | "jsonlines" | "json-lines" => Ok(OutputFormat::JsonLines),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

impl Default for OutputFormat {
    fn default() -> Self {
        OutputFormat::Text
    }
}

impl OutputFormat {
    /// Get all available output formats
    pub fn available_formats() -> &'static [Self] {
        &[OutputFormat::Text, OutputFormat::Json, OutputFormat::JsonLines]
    }

    /// File extension for per-method output files
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Text => "asm",
            OutputFormat::Json => "json",
            OutputFormat::JsonLines => "jsonl",
        }
    }

    /// Get a formatter for this output format
    pub fn get_formatter(&self) -> Box<dyn DisassemblyFormatter> {
        match self {
            OutputFormat::Text => Box::new(TextFormatter),
            OutputFormat::Json => Box::new(JsonFormatter),
            OutputFormat::JsonLines => Box::new(JsonLinesFormatter),
        }
    }
}

/// Formatter trait for listing output
pub trait DisassemblyFormatter: Send + Sync {
    /// Format one method's listing
    fn format(&self, listing: &Listing) -> Result<String, DisassemblyError>;
}

/// Format listings as plain assembly text
pub struct TextFormatter;

/// Format listings as pretty-printed JSON
pub struct JsonFormatter;

/// Format listings as JSON Lines
pub struct JsonLinesFormatter;

impl DisassemblyFormatter for TextFormatter {
    fn format(&self, listing: &Listing) -> Result<String, DisassemblyError> {
        let prefix = listing.comment_prefix;
        let address_digits = (listing.bitness / 4) as usize;
        let mut output = String::new();

        output.push_str(&format!("{} {}\n", prefix, "=".repeat(SEPARATOR_WIDTH)));
        output.push_str(&format!("{} {}\n", prefix, listing.method));
        output.push_str(&format!(
            "{} Size: {} (0x{:X}) bytes\n",
            prefix, listing.code_size, listing.code_size
        ));

        for line in &listing.lines {
            match line {
                ListingLine::Blank => output.push('\n'),
                ListingLine::Label { name } => output.push_str(&format!("{}:\n", name)),
                ListingLine::Source(statement) => {
                    for comment in statement.comment_lines(prefix) {
                        output.push_str(&comment);
                        output.push('\n');
                    }
                }
                ListingLine::Instruction { address, bytes, text } => {
                    let mut row = String::new();
                    match address {
                        Some(addr) => row.push_str(&format!("{:0width$X} ", addr, width = address_digits)),
                        None => row.push_str(HIDDEN_ADDRESS_COLUMN),
                    }
                    if let Some(bytes) = bytes {
                        row.push_str(&format!("{:<width$} ", bytes, width = BYTES_COLUMN_WIDTH * 2));
                    }
                    row.push_str(text);
                    output.push_str(row.trim_end());
                    output.push('\n');
                }
            }
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceStatement;

    fn sample_listing(address: Option<u64>, bytes: Option<&str>) -> Listing {
        Listing {
            method: "Ns.Type:Method():int".to_string(),
            code_size: 42,
            bitness: 64,
            comment_prefix: ";",
            lines: vec![
                ListingLine::Blank,
                ListingLine::Label { name: "LBL_0".to_string() },
                ListingLine::Source(SourceStatement {
                    text: "return x + y;".to_string(),
                    highlight_start: 7,
                    highlight_end: 12,
                    is_partial: true,
                }),
                ListingLine::Instruction {
                    address,
                    bytes: bytes.map(str::to_string),
                    text: "lea eax, [rcx + rdx]".to_string(),
                },
            ],
        }
    }

    #[test]
    fn test_text_formatter_columns() {
        let listing = sample_listing(Some(0x7ff8_1234_0000), Some("8D0411"));

        let result = TextFormatter.format(&listing).unwrap();
        let lines: Vec<&str> = result.lines().collect();

        assert_eq!(lines[0], format!("; {}", "=".repeat(80)));
        assert_eq!(lines[1], "; Ns.Type:Method():int");
        assert_eq!(lines[2], "; Size: 42 (0x2A) bytes");
        assert_eq!(lines[3], "");
        assert_eq!(lines[4], "LBL_0:");
        assert_eq!(lines[5], "; return x + y;");
        assert_eq!(lines[6], ";        ^^^^^");
        assert_eq!(
            lines[7],
            "00007FF812340000 8D0411               lea eax, [rcx + rdx]"
        );
    }

    #[test]
    fn test_text_formatter_hidden_columns() {
        let listing = sample_listing(None, None);

        let result = TextFormatter.format(&listing).unwrap();

        assert!(result.ends_with("\n    lea eax, [rcx + rdx]\n"));
    }

    #[test]
    fn test_text_formatter_32bit_address() {
        let mut listing = sample_listing(Some(0x0040_1000), None);
        listing.bitness = 32;

        let result = TextFormatter.format(&listing).unwrap();

        assert!(result.contains("\n00401000 lea eax, [rcx + rdx]\n"));
    }

    #[test]
    fn test_format_selection() {
        for format in OutputFormat::available_formats() {
            assert_eq!(format.to_string().parse::<OutputFormat>(), Ok(*format));
            let _ = format.get_formatter();
        }
        assert_eq!(OutputFormat::default().extension(), "asm");
        assert!("csv".parse::<OutputFormat>().is_err());
    }
}
