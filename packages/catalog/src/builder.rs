//! Derives a catalog from the characteristic hierarchy of a census extract.
//!
//! The extract repeats the full characteristic list for every geography.
//! Rows of a single geography level (one country row per characteristic in
//! practice) are enough to recover the hierarchy: a name without leading
//! whitespace starts a new group and is that group's total, indented names
//! below it are parts of that total and get it as their divisor.
//!
//! Characteristics that are already derived values (averages, medians,
//! percentages, rates, indexes, dollar amounts) never get a divisor, and
//! neither do the indented children of such a heading.

use std::collections::BTreeSet;
use std::path::Path;

use census_map_source::reader::RowReader;
use census_map_source::row::RawRow;
use census_map_source::{
    CHARACTERISTIC_ID_COLUMN, CHARACTERISTIC_NAME_COLUMN, GEO_LEVEL_COLUMN, SourceError,
    TextEncoding,
};
use census_map_statistics_models::{AttributeDefinition, AttributeId};

use crate::{Catalog, CatalogError, Category};

/// Geography level whose rows are read by default.
pub const DEFAULT_GEO_LEVEL: &str = "Country";

/// Category for indented characteristics that appear before any heading.
const UNCATEGORIZED: &str = "Uncategorized";

/// Name fragments that mark a characteristic as an already-derived value.
const COMPUTED_MARKERS: &[&str] = &[
    "Average", "Median", " %", "(%)", "index", " rate", "($)",
];

/// Whether a characteristic name denotes a derived value that must not be
/// divided again.
#[must_use]
pub fn is_computed_name(name: &str) -> bool {
    COMPUTED_MARKERS.iter().any(|marker| name.contains(marker))
}

/// Builds a catalog from the rows of `path` at `geo_level`.
///
/// # Errors
///
/// Returns [`CatalogError`] if the file cannot be read or the derived
/// catalog is invalid.
pub fn build_from_csv(
    path: &Path,
    geo_level: &str,
    encoding: TextEncoding,
) -> Result<Catalog, CatalogError> {
    let reader = RowReader::open(path, encoding)?;
    reader.require_columns(&[
        GEO_LEVEL_COLUMN,
        CHARACTERISTIC_ID_COLUMN,
        CHARACTERISTIC_NAME_COLUMN,
    ])?;

    let catalog = build_from_rows(reader, geo_level)?;

    log::info!(
        "Derived {} attributes in {} categories from {}",
        catalog.len(),
        catalog.categories().len(),
        path.display()
    );

    Ok(catalog)
}

/// Builds a catalog from already-opened rows.
///
/// Only the first row seen for each characteristic id is used.
///
/// # Errors
///
/// Returns [`CatalogError`] if a row cannot be read.
pub fn build_from_rows<I>(rows: I, geo_level: &str) -> Result<Catalog, CatalogError>
where
    I: IntoIterator<Item = Result<RawRow, SourceError>>,
{
    let mut categories: Vec<Category> = Vec::new();
    let mut seen: BTreeSet<AttributeId> = BTreeSet::new();
    // Heading of the current group and whether it is a derived value.
    let mut heading: Option<(AttributeId, bool)> = None;

    for row in rows {
        let row = row?;

        if row.get(GEO_LEVEL_COLUMN) != Some(geo_level) {
            continue;
        }

        let Some(raw_name) = row.get(CHARACTERISTIC_NAME_COLUMN) else {
            continue;
        };

        let Some(id) = row
            .get(CHARACTERISTIC_ID_COLUMN)
            .and_then(|v| v.trim().parse::<AttributeId>().ok())
        else {
            log::warn!(
                "Line {}: unparsable {CHARACTERISTIC_ID_COLUMN} {:?}",
                row.line(),
                row.get(CHARACTERISTIC_ID_COLUMN)
            );
            continue;
        };

        if !seen.insert(id) {
            continue;
        }

        let name = raw_name.trim().to_string();
        let indented = raw_name.starts_with(char::is_whitespace);
        let computed = is_computed_name(&name);

        if indented {
            let divisor = match heading {
                Some((head, false)) if !computed => Some(head),
                _ => None,
            };

            if heading.is_none() && categories.last().is_none_or(|c| c.name != UNCATEGORIZED) {
                categories.push(Category {
                    name: UNCATEGORIZED.to_string(),
                    attributes: Vec::new(),
                });
            }

            if let Some(category) = categories.last_mut() {
                category
                    .attributes
                    .push(AttributeDefinition { id, name, divisor });
            }
        } else {
            heading = Some((id, computed));
            categories.push(Category {
                name: name.clone(),
                attributes: vec![AttributeDefinition {
                    id,
                    name,
                    divisor: None,
                }],
            });
        }
    }

    Catalog::new(categories)
}
