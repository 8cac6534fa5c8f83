use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of an organization inside one generation (EIN order)
pub type DocId = u32;

/// Monotonic generation number. Generation 0 is the empty pre-import index.
pub type Generation = u64;

/// Length of a normalized EIN
pub const EIN_LEN: usize = 9;

/// Employer Identification Number, the unique key of an organization.
///
/// Always 9 uppercase ASCII alphanumerics once constructed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ein(String);

impl Ein {
    /// Normalize a raw identifier: trim, uppercase, drop one separating hyphen.
    /// Returns `None` when the result is not 9 ASCII alphanumerics.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        let mut value = String::with_capacity(EIN_LEN);
        let mut hyphens = 0;
        for ch in trimmed.chars() {
            if ch == '-' {
                hyphens += 1;
                continue;
            }
            if !ch.is_ascii_alphanumeric() {
                return None;
            }
            value.push(ch.to_ascii_uppercase());
        }
        if hyphens > 1 || value.len() != EIN_LEN {
            return None;
        }
        Some(Ein(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Ein {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Ein {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Ein::parse(&value).ok_or_else(|| format!("invalid EIN {:?}", value))
    }
}

impl From<Ein> for String {
    fn from(ein: Ein) -> Self {
        ein.0
    }
}

/// NTEE major group (first letter of the NTEE code)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum NteeCategory {
    A,
    B,
    C,
    D,
    E,
    F,
    G,
    H,
    I,
    J,
    K,
    L,
    M,
    N,
    O,
    P,
    Q,
    R,
    S,
    T,
    U,
    V,
    W,
    X,
    Y,
    Z,
    /// Empty or unrecognized code
    #[default]
    Other,
}

impl NteeCategory {
    pub const ALL: [NteeCategory; 27] = [
        NteeCategory::A,
        NteeCategory::B,
        NteeCategory::C,
        NteeCategory::D,
        NteeCategory::E,
        NteeCategory::F,
        NteeCategory::G,
        NteeCategory::H,
        NteeCategory::I,
        NteeCategory::J,
        NteeCategory::K,
        NteeCategory::L,
        NteeCategory::M,
        NteeCategory::N,
        NteeCategory::O,
        NteeCategory::P,
        NteeCategory::Q,
        NteeCategory::R,
        NteeCategory::S,
        NteeCategory::T,
        NteeCategory::U,
        NteeCategory::V,
        NteeCategory::W,
        NteeCategory::X,
        NteeCategory::Y,
        NteeCategory::Z,
        NteeCategory::Other,
    ];

    /// Map a raw NTEE code (e.g. "B20", "p99") to its major group.
    /// Codes that do not start with a letter land in `Other`.
    pub fn from_code(code: &str) -> Self {
        match code.trim().chars().next() {
            Some(ch) if ch.is_ascii_alphabetic() => {
                Self::from_letter(ch.to_ascii_uppercase()).unwrap_or(NteeCategory::Other)
            }
            _ => NteeCategory::Other,
        }
    }

    fn from_letter(letter: char) -> Option<Self> {
        let idx = (letter as u8).checked_sub(b'A')? as usize;
        if idx < 26 { Some(Self::ALL[idx]) } else { None }
    }

    /// Parse a user-supplied category: a single letter, "other", or a description
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.len() == 1 {
            let ch = value.chars().next()?;
            if ch.is_ascii_alphabetic() {
                return Self::from_letter(ch.to_ascii_uppercase());
            }
            return None;
        }
        if value.eq_ignore_ascii_case("other") {
            return Some(NteeCategory::Other);
        }
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.description().eq_ignore_ascii_case(value))
    }

    pub fn code(&self) -> &'static str {
        match self {
            NteeCategory::A => "A",
            NteeCategory::B => "B",
            NteeCategory::C => "C",
            NteeCategory::D => "D",
            NteeCategory::E => "E",
            NteeCategory::F => "F",
            NteeCategory::G => "G",
            NteeCategory::H => "H",
            NteeCategory::I => "I",
            NteeCategory::J => "J",
            NteeCategory::K => "K",
            NteeCategory::L => "L",
            NteeCategory::M => "M",
            NteeCategory::N => "N",
            NteeCategory::O => "O",
            NteeCategory::P => "P",
            NteeCategory::Q => "Q",
            NteeCategory::R => "R",
            NteeCategory::S => "S",
            NteeCategory::T => "T",
            NteeCategory::U => "U",
            NteeCategory::V => "V",
            NteeCategory::W => "W",
            NteeCategory::X => "X",
            NteeCategory::Y => "Y",
            NteeCategory::Z => "Z",
            NteeCategory::Other => "other",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            NteeCategory::A => "Arts, Culture & Humanities",
            NteeCategory::B => "Education",
            NteeCategory::C => "Environment",
            NteeCategory::D => "Animal-Related",
            NteeCategory::E => "Health Care",
            NteeCategory::F => "Mental Health & Crisis Intervention",
            NteeCategory::G => "Diseases, Disorders & Medical Disciplines",
            NteeCategory::H => "Medical Research",
            NteeCategory::I => "Crime & Legal-Related",
            NteeCategory::J => "Employment",
            NteeCategory::K => "Food, Agriculture & Nutrition",
            NteeCategory::L => "Housing & Shelter",
            NteeCategory::M => "Public Safety, Disaster Preparedness & Relief",
            NteeCategory::N => "Recreation & Sports",
            NteeCategory::O => "Youth Development",
            NteeCategory::P => "Human Services",
            NteeCategory::Q => "International, Foreign Affairs & National Security",
            NteeCategory::R => "Civil Rights, Social Action & Advocacy",
            NteeCategory::S => "Community Improvement & Capacity Building",
            NteeCategory::T => "Philanthropy, Voluntarism & Grantmaking Foundations",
            NteeCategory::U => "Science & Technology",
            NteeCategory::V => "Social Science",
            NteeCategory::W => "Public & Societal Benefit",
            NteeCategory::X => "Religion-Related",
            NteeCategory::Y => "Mutual & Membership Benefit",
            NteeCategory::Z => "Unknown",
            NteeCategory::Other => "Other / Unclassified",
        }
    }
}

/// Canonical nonprofit record, the unit of indexing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub ein: Ein,
    pub name: String,
    #[serde(default)]
    pub street: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub zip: String,
    #[serde(default)]
    pub ntee_code: String,
    #[serde(default)]
    pub category: NteeCategory,
    #[serde(default)]
    pub subsection: String,
    #[serde(default)]
    pub foundation: String,
    #[serde(default)]
    pub deductibility: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub ruling: String,
    #[serde(default)]
    pub tax_period: String,
    #[serde(default)]
    pub organization_code: String,
    #[serde(default)]
    pub revenue: u64,
    #[serde(default)]
    pub income: u64,
    #[serde(default)]
    pub assets: u64,
}

impl Organization {
    /// Column names, in export order
    pub const COLUMNS: [&'static str; 18] = [
        "ein",
        "name",
        "street",
        "city",
        "state",
        "zip",
        "ntee_code",
        "category",
        "subsection",
        "foundation",
        "deductibility",
        "status",
        "ruling",
        "tax_period",
        "organization_code",
        "revenue",
        "income",
        "assets",
    ];

    /// Minimal record with only key and name set
    pub fn new(ein: Ein, name: impl Into<String>) -> Self {
        Self {
            ein,
            name: name.into(),
            street: String::new(),
            city: String::new(),
            state: String::new(),
            zip: String::new(),
            ntee_code: String::new(),
            category: NteeCategory::Other,
            subsection: String::new(),
            foundation: String::new(),
            deductibility: String::new(),
            status: String::new(),
            ruling: String::new(),
            tax_period: String::new(),
            organization_code: String::new(),
            revenue: 0,
            income: 0,
            assets: 0,
        }
    }

    /// Field values as strings, aligned with [`Organization::COLUMNS`]
    pub fn column_values(&self) -> [String; 18] {
        [
            self.ein.to_string(),
            self.name.clone(),
            self.street.clone(),
            self.city.clone(),
            self.state.clone(),
            self.zip.clone(),
            self.ntee_code.clone(),
            self.category.code().to_string(),
            self.subsection.clone(),
            self.foundation.clone(),
            self.deductibility.clone(),
            self.status.clone(),
            self.ruling.clone(),
            self.tax_period.clone(),
            self.organization_code.clone(),
            self.revenue.to_string(),
            self.income.to_string(),
            self.assets.to_string(),
        ]
    }
}

/// A normalized record tagged with its position in the import pass.
/// `seq` decides last-write-wins between duplicate EINs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedRecord {
    pub seq: u64,
    pub org: Organization,
}

/// Generation metadata stored in meta.json
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub version: u32,
    pub generation: Generation,
    pub doc_count: u32,
    pub term_count: u32,
    /// Unix timestamp (seconds) when the generation finished building
    pub built_at: i64,
    /// Import job that produced this generation
    pub source_job: Option<String>,
}

impl IndexMeta {
    pub const VERSION: u32 = 1;
}

impl Default for IndexMeta {
    fn default() -> Self {
        Self {
            version: Self::VERSION,
            generation: 0,
            doc_count: 0,
            term_count: 0,
            built_at: 0,
            source_job: None,
        }
    }
}

/// Term posting: one organization containing the term, with capped frequencies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Posting {
    pub doc_id: DocId,
    /// Occurrences in the legal name (capped)
    pub name_tf: u8,
    /// Occurrences in EIN/street/city (capped)
    pub secondary_tf: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ein_parse() {
        assert_eq!(Ein::parse(" 12-3456789 ").unwrap().as_str(), "123456789");
        assert_eq!(Ein::parse("ab1234567").unwrap().as_str(), "AB1234567");
        assert!(Ein::parse("").is_none());
        assert!(Ein::parse("12345678").is_none());
        assert!(Ein::parse("1234567890").is_none());
        assert!(Ein::parse("12-34-56789").is_none());
        assert!(Ein::parse("12345678!").is_none());
    }

    #[test]
    fn test_ntee_from_code() {
        assert_eq!(NteeCategory::from_code("B20"), NteeCategory::B);
        assert_eq!(NteeCategory::from_code("p99"), NteeCategory::P);
        assert_eq!(NteeCategory::from_code("9Z"), NteeCategory::Other);
        assert_eq!(NteeCategory::from_code(""), NteeCategory::Other);
    }

    #[test]
    fn test_ntee_parse_user_input() {
        assert_eq!(NteeCategory::parse("k"), Some(NteeCategory::K));
        assert_eq!(NteeCategory::parse("Education"), Some(NteeCategory::B));
        assert_eq!(NteeCategory::parse("other"), Some(NteeCategory::Other));
        assert_eq!(NteeCategory::parse("7"), None);
        assert_eq!(NteeCategory::parse("nonsense"), None);
    }

    #[test]
    fn test_ein_serde_rejects_invalid() {
        let ok: Ein = serde_json::from_str("\"123456789\"").unwrap();
        assert_eq!(ok.as_str(), "123456789");
        assert!(serde_json::from_str::<Ein>("\"12\"").is_err());
    }
}
