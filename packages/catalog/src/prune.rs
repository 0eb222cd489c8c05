//! Removes attributes that carry no data.
//!
//! Attributes whose counts sum to zero over every relevant row are useless
//! on the map. They are dropped unless a remaining attribute still needs
//! them as a divisor. Categories left empty are dropped as well.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use census_map_source::reader::RowReader;
use census_map_source::row::RawRow;
use census_map_source::{
    CHARACTERISTIC_ID_COLUMN, COUNT_TOTAL_COLUMN, GEO_LEVEL_COLUMN, REQUIRED_COLUMNS,
    SourceError, TextEncoding,
};
use census_map_statistics_models::AttributeId;

use crate::{Catalog, CatalogError, Category};

/// Outcome of a prune.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    /// Attributes removed from the catalog.
    pub removed: Vec<AttributeId>,
    /// Empty attributes kept because another attribute divides by them.
    pub kept_as_divisor: Vec<AttributeId>,
}

/// Sums the counts of every catalog attribute over rows at `geo_level`.
///
/// Unparsable counts contribute nothing.
///
/// # Errors
///
/// Returns [`SourceError`] if a row cannot be read.
pub fn attribute_totals<I>(
    rows: I,
    geo_level: &str,
    catalog: &Catalog,
    totals: &mut BTreeMap<AttributeId, f64>,
) -> Result<(), SourceError>
where
    I: IntoIterator<Item = Result<RawRow, SourceError>>,
{
    for row in rows {
        let row = row?;

        if row.get(GEO_LEVEL_COLUMN) != Some(geo_level) {
            continue;
        }

        let Some(id) = row
            .get(CHARACTERISTIC_ID_COLUMN)
            .and_then(|v| v.trim().parse::<AttributeId>().ok())
            .filter(|&id| catalog.contains(id))
        else {
            continue;
        };

        let value = row
            .get(COUNT_TOTAL_COLUMN)
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite())
            .unwrap_or(0.0);

        *totals.entry(id).or_insert(0.0) += value;
    }

    Ok(())
}

/// Drops attributes whose total is not positive.
///
/// # Errors
///
/// Returns [`CatalogError`] if the pruned catalog fails validation.
pub fn prune(
    catalog: &Catalog,
    totals: &BTreeMap<AttributeId, f64>,
) -> Result<(Catalog, PruneReport), CatalogError> {
    let has_data = |id: AttributeId| totals.get(&id).is_some_and(|&total| total > 0.0);

    let mut keep: BTreeSet<AttributeId> = catalog
        .attributes()
        .map(|a| a.id)
        .filter(|&id| has_data(id))
        .collect();

    // Divisors of kept attributes stay, transitively.
    loop {
        let missing: Vec<AttributeId> = keep
            .iter()
            .filter_map(|&id| catalog.divisor_of(id))
            .filter(|divisor| !keep.contains(divisor))
            .collect();

        if missing.is_empty() {
            break;
        }
        keep.extend(missing);
    }

    let mut report = PruneReport::default();
    let mut categories = Vec::new();

    for category in catalog.categories() {
        let mut attributes = Vec::new();

        for attribute in &category.attributes {
            if keep.contains(&attribute.id) {
                if !has_data(attribute.id) {
                    report.kept_as_divisor.push(attribute.id);
                }
                attributes.push(attribute.clone());
            } else {
                report.removed.push(attribute.id);
            }
        }

        if !attributes.is_empty() {
            categories.push(Category {
                name: category.name.clone(),
                attributes,
            });
        }
    }

    Ok((Catalog::new(categories)?, report))
}

/// Totals every input file and prunes the catalog.
///
/// # Errors
///
/// Returns [`CatalogError`] if any file cannot be read.
pub fn prune_files(
    catalog: &Catalog,
    files: &[PathBuf],
    geo_level: &str,
    encoding: TextEncoding,
) -> Result<(Catalog, PruneReport), CatalogError> {
    let mut totals = BTreeMap::new();

    for path in files {
        log::info!("Totalling attribute counts in {}", path.display());
        let reader = RowReader::open(path, encoding)?;
        reader.require_columns(REQUIRED_COLUMNS)?;
        attribute_totals(reader, geo_level, catalog, &mut totals)?;
    }

    let (pruned, report) = prune(catalog, &totals)?;

    log::info!(
        "Pruned {} attribute(s) without data ({} kept as divisors), {} remain",
        report.removed.len(),
        report.kept_as_divisor.len(),
        pruned.len()
    );

    Ok((pruned, report))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Catalog {
        Catalog::from_json(
            r#"{
                "Households": [
                    { "id": 50, "name": "Total - Households" },
                    { "id": 51, "name": "One person", "divisor": 50 },
                    { "id": 52, "name": "Two persons", "divisor": 50 }
                ],
                "Empty": [
                    { "id": 60, "name": "Nothing here" }
                ]
            }"#,
        )
        .unwrap()
    }

    fn row(level: &str, id: &str, count: &str) -> Result<RawRow, SourceError> {
        Ok(RawRow::from_pairs([
            (GEO_LEVEL_COLUMN, level),
            (CHARACTERISTIC_ID_COLUMN, id),
            (COUNT_TOTAL_COLUMN, count),
        ]))
    }

    #[test]
    fn sums_only_relevant_rows() {
        let mut totals = BTreeMap::new();
        attribute_totals(
            vec![
                row("Dissemination area", "51", "3"),
                row("Dissemination area", "51", "4.5"),
                row("Country", "51", "1000"),
                row("Dissemination area", "51", "x"),
                row("Dissemination area", "99", "7"),
            ],
            "Dissemination area",
            &catalog(),
            &mut totals,
        )
        .unwrap();

        assert_eq!(totals.len(), 1);
        assert!((totals[&51] - 7.5).abs() < f64::EPSILON);
    }

    #[test]
    fn keeps_divisors_of_kept_attributes() {
        let totals = BTreeMap::from([(50, 0.0), (51, 12.0), (52, 0.0), (60, 0.0)]);

        let (pruned, report) = prune(&catalog(), &totals).unwrap();

        assert_eq!(report.removed, [52, 60]);
        assert_eq!(report.kept_as_divisor, [50]);
        assert!(pruned.contains(50));
        assert!(pruned.contains(51));
        assert_eq!(pruned.categories().len(), 1);
    }
}
