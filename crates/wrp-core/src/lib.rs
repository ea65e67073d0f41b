//! Core domain model for the weigh-off results pipeline.

use serde::{Deserialize, Deserializer, Serialize};

pub const CRATE_NAME: &str = "wrp-core";

/// Placeholder stored for absent text fields. Downstream grouping treats it
/// as a real, matchable value rather than a missing-value marker.
pub const UNKNOWN: &str = "Unknown";

/// One scraped weigh-off row as returned by the raw-data fetch RPC.
///
/// Fields arrive as JSON and may be null, absent, or numbers rendered as
/// strings; everything is kept optional and cleaned later. `category` and
/// `year` come from the partition, not the row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    #[serde(default)]
    pub place: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub weight_lbs: Option<String>,
    #[serde(default)]
    pub grower_name: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state_prov: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub gpc_site: Option<String>,
    #[serde(default)]
    pub seed_mother: Option<String>,
    #[serde(default)]
    pub pollinator_father: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub ott: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub est_weight: Option<String>,
}

/// Accept `"1,234.5"`, `1234.5`, `1234`, or null for numeric-ish columns.
fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

/// Normalized grower identity derived deterministically from a raw name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalName {
    pub surname_or_team: String,
    pub given_name: String,
    pub is_team: bool,
}

impl CanonicalName {
    /// Reconstruct the display string: `"Surname, Given"`, or the bare
    /// surname/team string when there is no given-name component.
    pub fn render(&self) -> String {
        if self.is_team || self.given_name.is_empty() {
            self.surname_or_team.clone()
        } else {
            format!("{}, {}", self.surname_or_team, self.given_name)
        }
    }
}

/// Classification of a staged entry, derived from the `place` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    Official,
    Damaged,
    Exhibition,
    Disqualified,
    Unknown,
}

impl EntryType {
    /// Derive the entry type from the raw place string.
    ///
    /// `"DMG"` and `"EXH"` are exact (case-insensitive) markers; a purely
    /// numeric place, or one numeric after stripping a leading `"T-"` tie
    /// marker, is an official result; anything containing `"DNQ"` is a
    /// disqualification.
    pub fn classify(place: &str) -> Self {
        let place = place.trim();
        if place.eq_ignore_ascii_case("DMG") {
            return EntryType::Damaged;
        }
        if place.eq_ignore_ascii_case("EXH") {
            return EntryType::Exhibition;
        }
        let numeric_part = place
            .strip_prefix("T-")
            .or_else(|| place.strip_prefix("t-"))
            .unwrap_or(place);
        if !numeric_part.is_empty() && numeric_part.chars().all(|c| c.is_ascii_digit()) {
            return EntryType::Official;
        }
        if place.to_ascii_uppercase().contains("DNQ") {
            return EntryType::Disqualified;
        }
        EntryType::Unknown
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Official => "official",
            EntryType::Damaged => "dmg",
            EntryType::Exhibition => "exh",
            EntryType::Disqualified => "dnq",
            EntryType::Unknown => "unknown",
        }
    }
}

/// The staged unit of work: one cleaned weigh-off result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub category: String,
    pub year: i32,
    pub place: String,
    pub weight_lbs: Option<f64>,
    pub processed_grower_name: String,
    pub original_grower_name: String,
    pub city: String,
    pub state_prov: String,
    pub country: String,
    pub gpc_site: String,
    pub seed_mother: String,
    pub pollinator_father: String,
    pub ott: Option<f64>,
    pub est_weight: Option<f64>,
    pub entry_type: EntryType,
}

impl Entry {
    /// The identity under which duplicates are discarded within one load.
    ///
    /// Deliberately omits `place`/`entry_type`: two physically different
    /// rows with identical grower/site/year/weight/category collapse into
    /// one, matching the behavior of the system this data comes from.
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            grower: self.processed_grower_name.clone(),
            gpc_site: self.gpc_site.clone(),
            year: self.year,
            weight_bits: self.weight_lbs.map(f64::to_bits),
            category: self.category.clone(),
        }
    }
}

/// Hashable projection of the fields that identify a logical entry.
/// Weight is carried as its bit pattern so the key is `Eq + Hash`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub grower: String,
    pub gpc_site: String,
    pub year: i32,
    pub weight_bits: Option<u64>,
    pub category: String,
}

/// Unique weigh-off location tuple projected out of one partition's entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Site {
    pub year: i32,
    pub gpc_site: String,
    pub city: String,
    pub state_prov: String,
    pub country: String,
}
