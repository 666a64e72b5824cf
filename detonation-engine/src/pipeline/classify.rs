//! Classification of in-guest archiver diagnostics
//!
//! The archiver only reports failures as free text, so the known cases are
//! matched against an explicit pattern table. Anything unmatched is
//! `Unknown` and keeps its raw diagnostic.

use lazy_static::lazy_static;
use regex::Regex;

pub const WRONG_PASSWORD_MESSAGE: &str = "Extraction failed: The password provided was incorrect.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionFailure {
    WrongPassword,
    CorruptArchive,
    NotAnArchive,
    Unknown,
}

lazy_static! {
    // Checked in order: encrypted-data errors mention both "data error" and "wrong password"
    static ref PATTERNS: Vec<(ExtractionFailure, Regex)> = vec![
        (
            ExtractionFailure::WrongPassword,
            Regex::new(r"(?i)wrong\s+password").expect("valid pattern"),
        ),
        (
            ExtractionFailure::NotAnArchive,
            Regex::new(r"(?i)can\s*not open (the )?file as archive|is not archive")
                .expect("valid pattern"),
        ),
        (
            ExtractionFailure::CorruptArchive,
            Regex::new(r"(?i)headers error|data error|crc failed|unexpected end of (archive|data)")
                .expect("valid pattern"),
        ),
    ];
}

pub fn classify_extraction_failure(diagnostic: &str) -> ExtractionFailure {
    PATTERNS
        .iter()
        .find(|(_, pattern)| pattern.is_match(diagnostic))
        .map(|(kind, _)| *kind)
        .unwrap_or(ExtractionFailure::Unknown)
}

/// Caller-facing message for a failed extraction
pub fn extraction_failure_message(kind: ExtractionFailure, diagnostic: &str) -> String {
    match kind {
        ExtractionFailure::WrongPassword => WRONG_PASSWORD_MESSAGE.to_string(),
        _ => format!("Failed to extract archive: {}", diagnostic),
    }
}
