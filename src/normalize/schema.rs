//! Source column layout.
//!
//! A `Schema` is built from a source's header record and tells the normalizer
//! which column holds which canonical field.

use csv::ByteRecord;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How to interpret a source file's columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SchemaVersion {
    /// EO BMF extract with dollar amounts in ASSET_AMT / INCOME_AMT / REVENUE_AMT
    #[default]
    EoBmf,
    /// EO BMF extract where amount columns carry IRS amount codes (0-9, A-D)
    EoBmfCodes,
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaVersion::EoBmf => f.write_str("eo-bmf"),
            SchemaVersion::EoBmfCodes => f.write_str("eo-bmf-codes"),
        }
    }
}

impl FromStr for SchemaVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "eo-bmf" | "eobmf" | "bmf" => Ok(SchemaVersion::EoBmf),
            "eo-bmf-codes" | "codes" => Ok(SchemaVersion::EoBmfCodes),
            other => Err(format!("unknown schema version {:?}", other)),
        }
    }
}

/// Canonical fields a source column can feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Ein,
    Name,
    Street,
    City,
    State,
    Zip,
    NteeCode,
    Subsection,
    Foundation,
    Deductibility,
    Status,
    Ruling,
    TaxPeriod,
    OrganizationCode,
    Revenue,
    Income,
    Assets,
}

impl Field {
    const COUNT: usize = 17;

    fn slot(self) -> usize {
        self as usize
    }

    /// Header names accepted for this field (upper case)
    fn aliases(self) -> &'static [&'static str] {
        match self {
            Field::Ein => &["EIN"],
            Field::Name => &["NAME", "LEGAL_NAME"],
            Field::Street => &["STREET", "ADDRESS"],
            Field::City => &["CITY"],
            Field::State => &["STATE"],
            Field::Zip => &["ZIP", "ZIP_CODE"],
            Field::NteeCode => &["NTEE_CD", "NTEE_CODE", "NTEE"],
            Field::Subsection => &["SUBSECTION"],
            Field::Foundation => &["FOUNDATION"],
            Field::Deductibility => &["DEDUCTIBILITY"],
            Field::Status => &["STATUS"],
            Field::Ruling => &["RULING"],
            Field::TaxPeriod => &["TAX_PERIOD"],
            Field::OrganizationCode => &["ORGANIZATION"],
            Field::Revenue => &["REVENUE_AMT", "REVENUE"],
            Field::Income => &["INCOME_AMT", "INCOME"],
            Field::Assets => &["ASSET_AMT", "ASSETS"],
        }
    }

    const ALL: [Field; Field::COUNT] = [
        Field::Ein,
        Field::Name,
        Field::Street,
        Field::City,
        Field::State,
        Field::Zip,
        Field::NteeCode,
        Field::Subsection,
        Field::Foundation,
        Field::Deductibility,
        Field::Status,
        Field::Ruling,
        Field::TaxPeriod,
        Field::OrganizationCode,
        Field::Revenue,
        Field::Income,
        Field::Assets,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Field::Ein => "ein",
            Field::Name => "name",
            Field::Street => "street",
            Field::City => "city",
            Field::State => "state",
            Field::Zip => "zip",
            Field::NteeCode => "ntee_code",
            Field::Subsection => "subsection",
            Field::Foundation => "foundation",
            Field::Deductibility => "deductibility",
            Field::Status => "status",
            Field::Ruling => "ruling",
            Field::TaxPeriod => "tax_period",
            Field::OrganizationCode => "organization_code",
            Field::Revenue => "revenue",
            Field::Income => "income",
            Field::Assets => "assets",
        }
    }
}

/// Column mapping for one source file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    pub version: SchemaVersion,
    pub delimiter: u8,
    columns: [Option<usize>; Field::COUNT],
    width: usize,
}

impl Schema {
    /// Build a schema from a header line. Fails when there is no EIN column.
    pub fn from_header(header: &str, version: SchemaVersion, delimiter: u8) -> Result<Self, String> {
        Self::from_record(&parse_line(header.as_bytes(), delimiter), version, delimiter)
    }

    /// Build a schema from an already decoded header record
    pub fn from_record(header: &ByteRecord, version: SchemaVersion, delimiter: u8) -> Result<Self, String> {
        let mut columns = [None; Field::COUNT];

        for (idx, raw) in header.iter().enumerate() {
            let raw = if idx == 0 { raw.strip_prefix(BOM).unwrap_or(raw) } else { raw };
            let name = String::from_utf8_lossy(raw).trim().to_ascii_uppercase();
            if let Some(field) = Field::ALL.iter().find(|f| f.aliases().contains(&name.as_str())) {
                // First matching column wins
                columns[field.slot()].get_or_insert(idx);
            }
        }

        if columns[Field::Ein.slot()].is_none() {
            return Err("header has no EIN column".to_string());
        }

        Ok(Self {
            version,
            delimiter,
            columns,
            width: header.len(),
        })
    }

    pub fn column(&self, field: Field) -> Option<usize> {
        self.columns[field.slot()]
    }

    /// Number of columns declared by the header
    pub fn width(&self) -> usize {
        self.width
    }
}

const BOM: &[u8] = "\u{feff}".as_bytes();

/// Decode the first record of `line`. An empty line is one empty field.
pub fn parse_line(line: &[u8], delimiter: u8) -> ByteRecord {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(line);
    let mut record = ByteRecord::new();
    if !reader.read_byte_record(&mut record).unwrap_or(false) {
        record.clear();
        record.push_field(b"");
    }
    record
}

/// Re-encode a header record as one delimited line, quoting where needed
pub fn header_line(header: &ByteRecord, delimiter: u8) -> Result<String, String> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    writer.write_byte_record(header).map_err(|e| e.to_string())?;
    let mut line = writer.into_inner().map_err(|e| e.to_string())?;
    if line.last() == Some(&b'\n') {
        line.pop();
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

/// Dollar midpoint for an IRS amount code
pub fn amount_code_value(code: &str) -> Option<u64> {
    let value = match code.trim().to_ascii_uppercase().as_str() {
        "" | "0" => 0,
        "1" => 5_000,
        "2" => 25_000,
        "3" => 62_500,
        "4" => 175_000,
        "5" => 375_000,
        "6" => 750_000,
        "7" => 2_500_000,
        "8" => 7_500_000,
        "9" => 25_000_000,
        "A" => 75_000_000,
        "B" => 175_000_000,
        "C" => 375_000_000,
        "D" => 750_000_000,
        _ => return None,
    };
    Some(value)
}
