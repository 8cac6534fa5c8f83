//! Record normalization: decoded source records to canonical organizations.
//!
//! [`normalize_row`] is a pure function of its inputs, so normalizer workers
//! can run it in parallel without coordination. A row is rejected only when
//! its key cannot be recovered; bad secondary fields are coerced and reported
//! as [`FieldIssue`]s.

pub mod schema;

pub use schema::{Field, Schema, SchemaVersion, amount_code_value, header_line, parse_line};

use crate::index::types::{Ein, NteeCategory, Organization};
use csv::ByteRecord;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest legal name kept
const MAX_NAME_CHARS: usize = 500;
const MAX_ZIP_CHARS: usize = 10;

/// Why a row could not become an organization
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// EIN column empty
    MissingEin,
    /// EIN present but not 9 alphanumerics
    InvalidEin,
    /// Row too short to reach the key column
    MissingField,
    /// Row bytes are not UTF-8
    Encoding,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::MissingEin => "missing_ein",
            RejectReason::InvalidEin => "invalid_ein",
            RejectReason::MissingField => "missing_field",
            RejectReason::Encoding => "encoding",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row that was counted and dropped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedRow {
    /// Position of the row in the import pass
    pub row: u64,
    pub reason: RejectReason,
    /// Offending value, truncated
    pub detail: String,
}

/// A non-critical field that was coerced to a default
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldIssue {
    pub field: &'static str,
    pub value: String,
}

/// Successful normalization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    pub org: Organization,
    pub issues: Vec<FieldIssue>,
}

/// Normalize one decoded record at pass position `row`
pub fn normalize_row(raw: &ByteRecord, schema: &Schema, row: u64) -> Result<Normalized, RejectedRow> {
    let fields = raw
        .iter()
        .enumerate()
        .map(|(column, bytes)| {
            std::str::from_utf8(bytes).map_err(|e| RejectedRow {
                row,
                reason: RejectReason::Encoding,
                detail: format!("invalid utf-8 in column {} at byte {}", column + 1, e.valid_up_to()),
            })
        })
        .collect::<Result<Vec<&str>, _>>()?;

    let get = |field: Field| {
        schema
            .column(field)
            .and_then(|idx| fields.get(idx))
            .map(|v| v.trim())
            .unwrap_or("")
    };

    let ein_column = schema.column(Field::Ein).unwrap_or(0);
    let raw_ein = match fields.get(ein_column) {
        Some(value) => value.trim(),
        None => {
            return Err(RejectedRow {
                row,
                reason: RejectReason::MissingField,
                detail: format!("{} of {} columns", fields.len(), schema.width()),
            });
        }
    };
    if raw_ein.is_empty() {
        return Err(RejectedRow {
            row,
            reason: RejectReason::MissingEin,
            detail: String::new(),
        });
    }
    let ein = Ein::parse(raw_ein).ok_or_else(|| RejectedRow {
        row,
        reason: RejectReason::InvalidEin,
        detail: truncate(raw_ein, 32),
    })?;

    let mut issues = Vec::new();
    let mut amount = |field: Field| -> u64 {
        let value = get(field);
        match parse_amount(value, schema.version) {
            Some(n) => n,
            None => {
                issues.push(FieldIssue {
                    field: field.name(),
                    value: truncate(value, 32),
                });
                0
            }
        }
    };
    let revenue = amount(Field::Revenue);
    let income = amount(Field::Income);
    let assets = amount(Field::Assets);

    let ntee_code = get(Field::NteeCode).to_ascii_uppercase();
    let state = normalize_state(get(Field::State));

    let org = Organization {
        ein,
        name: truncate(get(Field::Name), MAX_NAME_CHARS),
        street: get(Field::Street).to_string(),
        city: get(Field::City).to_string(),
        state,
        zip: truncate(get(Field::Zip), MAX_ZIP_CHARS),
        category: NteeCategory::from_code(&ntee_code),
        ntee_code,
        subsection: get(Field::Subsection).to_string(),
        foundation: get(Field::Foundation).to_string(),
        deductibility: get(Field::Deductibility).to_string(),
        status: get(Field::Status).to_string(),
        ruling: get(Field::Ruling).to_string(),
        tax_period: get(Field::TaxPeriod).to_string(),
        organization_code: get(Field::OrganizationCode).to_string(),
        revenue,
        income,
        assets,
    };

    Ok(Normalized { org, issues })
}

/// Parse a non-negative amount. Empty means zero; anything else unparsable is `None`.
fn parse_amount(value: &str, version: SchemaVersion) -> Option<u64> {
    if value.is_empty() {
        return Some(0);
    }
    match version {
        SchemaVersion::EoBmf => {
            let digits = value.strip_prefix('+').unwrap_or(value);
            if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                digits.parse().ok()
            } else {
                None
            }
        }
        SchemaVersion::EoBmfCodes => amount_code_value(value),
    }
}

/// Two-letter uppercase state code; anything else becomes empty
fn normalize_state(value: &str) -> String {
    if value.len() == 2 && value.bytes().all(|b| b.is_ascii_alphabetic()) {
        value.to_ascii_uppercase()
    } else {
        String::new()
    }
}

fn truncate(value: &str, max_chars: usize) -> String {
    match value.char_indices().nth(max_chars) {
        Some((idx, _)) => value[..idx].to_string(),
        None => value.to_string(),
    }
}
