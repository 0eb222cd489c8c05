#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Census record, staged value, and attribute range types.
//!
//! These are the plain data types shared by the catalog, the staging store,
//! and the two-pass statistics pipeline. None of them perform I/O.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Census characteristic identifier (the `CHARACTERISTIC_ID` column).
pub type AttributeId = u32;

/// Terminal artifact of a run: attribute id to its trimmed range, or `None`
/// when the attribute had no eligible values.
///
/// `None` serializes as JSON `null`, which consumers read as "no data"
/// rather than an all-zero attribute.
pub type RangeMap = BTreeMap<AttributeId, Option<AttributeRange>>;

/// One selectable statistic from the attribute catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDefinition {
    /// Unique characteristic id.
    pub id: AttributeId,
    /// Display name shown in the attribute selector.
    pub name: String,
    /// Attribute whose value is the denominator when this attribute is
    /// expressed as a percentage.
    #[serde(default)]
    pub divisor: Option<AttributeId>,
}

impl AttributeDefinition {
    /// Returns the divisor to use for ratio computation.
    ///
    /// A divisor pointing at the attribute itself is ignored, so the value
    /// is never divided by itself.
    #[must_use]
    pub fn effective_divisor(&self) -> Option<AttributeId> {
        self.divisor.filter(|&divisor| divisor != self.id)
    }

    /// Whether the final values of this attribute are percentages.
    #[must_use]
    pub fn is_ratio(&self) -> bool {
        self.effective_divisor().is_some()
    }
}

/// A relevant census row, reduced to the fields the pipeline needs.
#[derive(Debug, Clone, PartialEq)]
pub struct CensusRecord {
    /// Geographic unit code (`DGUID`).
    pub entity: String,
    /// Characteristic id of the measured statistic.
    pub attribute_id: AttributeId,
    /// Raw count (`C1_COUNT_TOTAL`).
    pub value: f64,
}

impl CensusRecord {
    /// Staging key this record is written under.
    #[must_use]
    pub fn key(&self) -> StagedKey {
        StagedKey::new(self.entity.clone(), self.attribute_id)
    }

    /// Staging key of this record's entity under another attribute.
    #[must_use]
    pub fn key_for(&self, attribute_id: AttributeId) -> StagedKey {
        StagedKey::new(self.entity.clone(), attribute_id)
    }
}

/// Composite staging key: `(entity, attribute)`.
///
/// The textual form is `<entity>-<attribute id>`. Entity codes never end in
/// `-<digits>`, so the last dash always separates the two parts.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StagedKey {
    /// Geographic unit code.
    pub entity: String,
    /// Characteristic id.
    pub attribute_id: AttributeId,
}

impl StagedKey {
    /// Creates a key.
    #[must_use]
    pub fn new(entity: impl Into<String>, attribute_id: AttributeId) -> Self {
        Self {
            entity: entity.into(),
            attribute_id,
        }
    }
}

impl fmt::Display for StagedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.entity, self.attribute_id)
    }
}

/// Error returned when a textual staging key cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid staging key: {0:?}")]
pub struct ParseKeyError(pub String);

impl FromStr for StagedKey {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (entity, attribute) = s
            .rsplit_once('-')
            .ok_or_else(|| ParseKeyError(s.to_string()))?;

        if entity.is_empty() {
            return Err(ParseKeyError(s.to_string()));
        }

        let attribute_id = attribute
            .trim()
            .parse()
            .map_err(|_| ParseKeyError(s.to_string()))?;

        Ok(Self::new(entity, attribute_id))
    }
}

/// Trimmed value range of one attribute.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AttributeRange {
    /// Lower bound.
    pub min: f64,
    /// Upper bound.
    pub max: f64,
}

/// The two global passes of the aggregation pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    /// Stores raw per-(entity, attribute) counts.
    Raw,
    /// Rewrites counts as percentages of their divisor.
    Final,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raw => write!(f, "RAW"),
            Self::Final => write!(f, "FINAL"),
        }
    }
}

/// Counters for one pass over one input file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PassSummary {
    /// File name the pass read.
    pub file: String,
    /// Rows read from the file.
    pub rows_read: u64,
    /// Relevant records handled.
    pub records: u64,
    /// Rows skipped because their count was not numeric.
    pub skipped: u64,
    /// Values rewritten as a percentage of their divisor.
    pub ratios: u64,
    /// Records whose divisor value was absent or zero (raw value kept).
    pub divisor_missing: u64,
    /// Wall time of the pass.
    pub elapsed: Duration,
}

/// Result of a completed pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Input files processed by both passes.
    pub files: Vec<String>,
    /// Per-file Phase RAW counters.
    pub raw: Vec<PassSummary>,
    /// Per-file Phase FINAL counters.
    pub final_pass: Vec<PassSummary>,
    /// Attributes with a computed range.
    pub attributes_with_data: usize,
    /// Attributes that had no eligible values.
    pub attributes_without_data: usize,
    /// Wall time of the whole run.
    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staged_key_display_matches_wire_format() {
        let key = StagedKey::new("2021S051210010244", 8);
        assert_eq!(key.to_string(), "2021S051210010244-8");
    }

    #[test]
    fn staged_key_parses_on_last_dash() {
        let key: StagedKey = "A-B-42".parse().unwrap();
        assert_eq!(key, StagedKey::new("A-B", 42));
    }

    #[test]
    fn staged_key_rejects_missing_attribute() {
        assert!("2021S0512".parse::<StagedKey>().is_err());
        assert!("2021S0512-abc".parse::<StagedKey>().is_err());
        assert!("-12".parse::<StagedKey>().is_err());
    }

    #[test]
    fn self_referential_divisor_is_ignored() {
        let def = AttributeDefinition {
            id: 5,
            name: "Total".to_string(),
            divisor: Some(5),
        };
        assert_eq!(def.effective_divisor(), None);
        assert!(!def.is_ratio());
    }

    #[test]
    fn divisor_defaults_to_none_when_omitted() {
        let def: AttributeDefinition =
            serde_json::from_str(r#"{"id": 3, "name": "Population"}"#).unwrap();
        assert_eq!(def.divisor, None);
    }

    #[test]
    fn range_map_serializes_no_data_as_null() {
        let mut ranges = RangeMap::new();
        ranges.insert(1, Some(AttributeRange { min: 0.0, max: 47.0 }));
        ranges.insert(2, None);
        let json = serde_json::to_string(&ranges).unwrap();
        assert_eq!(json, r#"{"1":{"min":0.0,"max":47.0},"2":null}"#);
    }
}
