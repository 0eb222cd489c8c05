//! Source row filter.
//!
//! Decides which census rows feed the pipeline and reduces them to
//! [`CensusRecord`]s.

use std::sync::Arc;

use census_map_catalog::Catalog;
use census_map_source::row::RawRow;
use census_map_source::{
    CHARACTERISTIC_ID_COLUMN, COUNT_TOTAL_COLUMN, DGUID_COLUMN, GEO_LEVEL_COLUMN,
};
use census_map_statistics_models::{AttributeId, CensusRecord};

/// Why a relevant-looking row was dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SkipReason {
    /// The entity column is empty.
    #[error("empty {DGUID_COLUMN}")]
    MissingEntity,
    /// The count column does not hold a finite number.
    #[error("unparsable {COUNT_TOTAL_COLUMN} {0:?}")]
    InvalidCount(String),
}

/// Classification of one row.
#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome {
    /// The row is staged.
    Relevant(CensusRecord),
    /// Other geography level or an attribute outside the catalog.
    Irrelevant,
    /// Relevant level and attribute, but a field could not be used.
    Skipped(SkipReason),
}

impl RowOutcome {
    /// The record, if the row is relevant.
    #[must_use]
    pub fn into_record(self) -> Option<CensusRecord> {
        match self {
            Self::Relevant(record) => Some(record),
            Self::Irrelevant | Self::Skipped(_) => None,
        }
    }
}

/// Keeps rows at one geography level whose attribute is in the catalog.
#[derive(Debug, Clone)]
pub struct RowFilter {
    geo_level: String,
    catalog: Arc<Catalog>,
}

impl RowFilter {
    /// Creates a filter.
    #[must_use]
    pub fn new(geo_level: impl Into<String>, catalog: Arc<Catalog>) -> Self {
        Self {
            geo_level: geo_level.into(),
            catalog,
        }
    }

    /// Classifies `row`.
    #[must_use]
    pub fn classify(&self, row: &RawRow) -> RowOutcome {
        if row.get(GEO_LEVEL_COLUMN) != Some(self.geo_level.as_str()) {
            return RowOutcome::Irrelevant;
        }

        let Some(attribute_id) = row
            .get(CHARACTERISTIC_ID_COLUMN)
            .and_then(|v| v.trim().parse::<AttributeId>().ok())
            .filter(|&id| self.catalog.contains(id))
        else {
            return RowOutcome::Irrelevant;
        };

        let entity = row.get(DGUID_COLUMN).map(str::trim).unwrap_or_default();
        if entity.is_empty() {
            return RowOutcome::Skipped(SkipReason::MissingEntity);
        }

        let raw = row.get(COUNT_TOTAL_COLUMN).unwrap_or_default();
        let Some(value) = raw.trim().parse::<f64>().ok().filter(|v| v.is_finite()) else {
            return RowOutcome::Skipped(SkipReason::InvalidCount(raw.to_string()));
        };

        RowOutcome::Relevant(CensusRecord {
            entity: entity.to_string(),
            attribute_id,
            value,
        })
    }

    /// The catalog rows are checked against.
    #[must_use]
    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> RowFilter {
        let catalog = Catalog::from_json(
            r#"{ "Households": [
                { "id": 50, "name": "Total - Households" },
                { "id": 51, "name": "One person", "divisor": 50 }
            ] }"#,
        )
        .unwrap();
        RowFilter::new("Dissemination area", Arc::new(catalog))
    }

    fn row(level: &str, entity: &str, id: &str, count: &str) -> RawRow {
        RawRow::from_pairs([
            (GEO_LEVEL_COLUMN, level),
            (DGUID_COLUMN, entity),
            (CHARACTERISTIC_ID_COLUMN, id),
            (COUNT_TOTAL_COLUMN, count),
        ])
    }

    #[test]
    fn keeps_dissemination_area_rows_in_catalog() {
        let outcome = filter().classify(&row("Dissemination area", "DA1", "51", "12"));
        assert_eq!(
            outcome,
            RowOutcome::Relevant(CensusRecord {
                entity: "DA1".to_string(),
                attribute_id: 51,
                value: 12.0,
            })
        );
    }

    #[test]
    fn drops_other_levels_and_unknown_attributes() {
        let filter = filter();
        for row in [
            row("Country", "C1", "51", "12"),
            row("dissemination area", "DA1", "51", "12"),
            row("Dissemination area", "DA1", "52", "12"),
            row("Dissemination area", "DA1", "fifty", "12"),
        ] {
            assert_eq!(filter.classify(&row), RowOutcome::Irrelevant);
        }
    }

    #[test]
    fn skips_unparsable_counts() {
        let filter = filter();
        assert_eq!(
            filter.classify(&row("Dissemination area", "DA1", "51", "")),
            RowOutcome::Skipped(SkipReason::InvalidCount(String::new()))
        );
        assert_eq!(
            filter.classify(&row("Dissemination area", "DA1", "51", "x")),
            RowOutcome::Skipped(SkipReason::InvalidCount("x".to_string()))
        );
        assert_eq!(
            filter.classify(&row("Dissemination area", " ", "51", "3")),
            RowOutcome::Skipped(SkipReason::MissingEntity)
        );
    }

    #[test]
    fn missing_columns_are_irrelevant() {
        let row = RawRow::from_pairs([(DGUID_COLUMN, "DA1")]);
        assert_eq!(filter().classify(&row), RowOutcome::Irrelevant);
    }
}
