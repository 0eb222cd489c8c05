#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Census attribute catalog.
//!
//! The catalog lists every statistic the map can display, grouped into
//! categories, and records which attribute acts as the denominator when a
//! count is shown as a percentage. It is stored as JSON:
//!
//! ```json
//! {
//!   "Total - Age groups of the population - 100% data": [
//!     { "id": 8, "name": "Total - Age groups of the population - 100% data", "divisor": null },
//!     { "id": 9, "name": "0 to 14 years", "divisor": 8 }
//!   ]
//! }
//! ```
//!
//! Category order is preserved on load and save.

pub mod builder;
pub mod prune;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use census_map_statistics_models::{AttributeDefinition, AttributeId};

/// Errors that can occur while loading or deriving a catalog.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// The catalog file could not be read or written.
    #[error("Catalog file {}: {source}", path.display())]
    File {
        /// Catalog path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// JSON parse or serialization error.
    #[error("Catalog JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Reading a census file failed.
    #[error(transparent)]
    Source(#[from] census_map_source::SourceError),

    /// The same attribute id appears twice.
    #[error("Attribute {id} is defined more than once")]
    DuplicateAttribute {
        /// Repeated id.
        id: AttributeId,
    },

    /// A divisor points at an attribute the catalog does not define.
    #[error("Attribute {id} uses divisor {divisor}, which is not in the catalog")]
    UnknownDivisor {
        /// Attribute declaring the divisor.
        id: AttributeId,
        /// Missing divisor id.
        divisor: AttributeId,
    },
}

/// A named group of attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Category {
    /// Heading shown in the attribute selector.
    pub name: String,
    /// Attributes in display order.
    pub attributes: Vec<AttributeDefinition>,
}

/// Validated, read-only attribute catalog.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    categories: Vec<Category>,
    /// Attribute id to `(category index, attribute index)`.
    index: BTreeMap<AttributeId, (usize, usize)>,
    /// Ids some other attribute divides by.
    divisors: BTreeSet<AttributeId>,
}

impl Catalog {
    /// Validates `categories` and builds the id index.
    ///
    /// A divisor equal to the attribute's own id is accepted with a warning
    /// and treated as "no divisor" everywhere downstream. A divisor may have
    /// a divisor of its own.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::DuplicateAttribute`] or
    /// [`CatalogError::UnknownDivisor`].
    pub fn new(categories: Vec<Category>) -> Result<Self, CatalogError> {
        let mut index = BTreeMap::new();
        let mut divisors = BTreeSet::new();

        for (c, category) in categories.iter().enumerate() {
            for (a, attribute) in category.attributes.iter().enumerate() {
                if index.insert(attribute.id, (c, a)).is_some() {
                    return Err(CatalogError::DuplicateAttribute { id: attribute.id });
                }
            }
        }

        for attribute in categories.iter().flat_map(|c| &c.attributes) {
            match attribute.divisor {
                Some(divisor) if divisor == attribute.id => {
                    log::warn!(
                        "Attribute {} ({}) is its own divisor; treating it as having no divisor",
                        attribute.id,
                        attribute.name
                    );
                }
                Some(divisor) => {
                    if !index.contains_key(&divisor) {
                        return Err(CatalogError::UnknownDivisor {
                            id: attribute.id,
                            divisor,
                        });
                    }
                    divisors.insert(divisor);
                }
                None => {}
            }
        }

        Ok(Self {
            categories,
            index,
            divisors,
        })
    }

    /// Parses and validates catalog JSON.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] if the JSON is malformed or fails validation.
    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let map: serde_json::Map<String, serde_json::Value> = serde_json::from_str(json)?;

        let categories = map
            .into_iter()
            .map(|(name, items)| {
                Ok(Category {
                    name,
                    attributes: serde_json::from_value(items)?,
                })
            })
            .collect::<Result<Vec<_>, serde_json::Error>>()?;

        Self::new(categories)
    }

    /// Loads the catalog from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] if the file cannot be read or is invalid.
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let json = std::fs::read_to_string(path).map_err(|source| CatalogError::File {
            path: path.to_path_buf(),
            source,
        })?;

        let catalog = Self::from_json(&json)?;

        log::info!(
            "Loaded {} attributes in {} categories from {}",
            catalog.len(),
            catalog.categories.len(),
            path.display()
        );

        Ok(catalog)
    }

    /// Serializes the catalog to pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Json`] if serialization fails.
    pub fn to_json(&self) -> Result<String, CatalogError> {
        let mut map = serde_json::Map::new();
        for category in &self.categories {
            map.insert(
                category.name.clone(),
                serde_json::to_value(&category.attributes)?,
            );
        }
        Ok(serde_json::to_string_pretty(&map)?)
    }

    /// Writes the catalog to `path`, replacing any existing file.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] if serialization or the write fails.
    pub fn save(&self, path: &Path) -> Result<(), CatalogError> {
        let json = self.to_json()?;
        let file_error = |source| CatalogError::File {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(file_error)?;
        }
        std::fs::write(path, json).map_err(file_error)
    }

    /// Looks up an attribute by id.
    #[must_use]
    pub fn get(&self, id: AttributeId) -> Option<&AttributeDefinition> {
        self.index
            .get(&id)
            .map(|&(c, a)| &self.categories[c].attributes[a])
    }

    /// Whether `id` is a catalog attribute.
    #[must_use]
    pub fn contains(&self, id: AttributeId) -> bool {
        self.index.contains_key(&id)
    }

    /// Divisor to apply to `id`, ignoring self-references.
    #[must_use]
    pub fn divisor_of(&self, id: AttributeId) -> Option<AttributeId> {
        self.get(id).and_then(AttributeDefinition::effective_divisor)
    }

    /// Whether another attribute uses `id` as its divisor.
    #[must_use]
    pub fn is_divisor(&self, id: AttributeId) -> bool {
        self.divisors.contains(&id)
    }

    /// All attributes in category order.
    pub fn attributes(&self) -> impl Iterator<Item = &AttributeDefinition> {
        self.categories.iter().flat_map(|c| c.attributes.iter())
    }

    /// Categories in display order.
    #[must_use]
    pub fn categories(&self) -> &[Category] {
        &self.categories
    }

    /// Number of attributes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether the catalog defines no attributes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"{
        "Total - Age groups": [
            { "id": 8, "name": "Total - Age groups", "divisor": null },
            { "id": 9, "name": "0 to 14 years", "divisor": 8 }
        ],
        "Population, 2021": [
            { "id": 1, "name": "Population, 2021" }
        ]
    }"#;

    #[test]
    fn loads_categories_in_file_order() {
        let catalog = Catalog::from_json(CATALOG).unwrap();
        let names: Vec<&str> = catalog.categories().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["Total - Age groups", "Population, 2021"]);
        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.divisor_of(9), Some(8));
        assert_eq!(catalog.divisor_of(8), None);
        assert_eq!(catalog.get(1).unwrap().name, "Population, 2021");
        assert!(!catalog.contains(2));
    }

    #[test]
    fn rejects_duplicate_ids() {
        let json = r#"{ "A": [ { "id": 1, "name": "a" } ], "B": [ { "id": 1, "name": "b" } ] }"#;
        assert!(matches!(
            Catalog::from_json(json),
            Err(CatalogError::DuplicateAttribute { id: 1 })
        ));
    }

    #[test]
    fn rejects_unknown_divisor() {
        let json = r#"{ "A": [ { "id": 1, "name": "a", "divisor": 7 } ] }"#;
        assert!(matches!(
            Catalog::from_json(json),
            Err(CatalogError::UnknownDivisor { id: 1, divisor: 7 })
        ));
    }

    #[test]
    fn accepts_divisor_with_its_own_divisor() {
        let json = r#"{ "A": [
            { "id": 1, "name": "a" },
            { "id": 2, "name": "b", "divisor": 1 },
            { "id": 3, "name": "c", "divisor": 2 }
        ] }"#;
        let catalog = Catalog::from_json(json).unwrap();
        assert_eq!(catalog.divisor_of(3), Some(2));
        assert_eq!(catalog.divisor_of(2), Some(1));
        assert!(catalog.is_divisor(1));
        assert!(catalog.is_divisor(2));
        assert!(!catalog.is_divisor(3));
    }

    #[test]
    fn self_divisor_is_accepted_but_ignored() {
        let json = r#"{ "A": [ { "id": 4, "name": "a", "divisor": 4 } ] }"#;
        let catalog = Catalog::from_json(json).unwrap();
        assert_eq!(catalog.get(4).unwrap().divisor, Some(4));
        assert_eq!(catalog.divisor_of(4), None);
        assert!(!catalog.is_divisor(4));
    }

    #[test]
    fn save_then_load_keeps_order_and_divisors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output").join("menu_list.json");

        let catalog = Catalog::from_json(CATALOG).unwrap();
        catalog.save(&path).unwrap();

        let reloaded = Catalog::load(&path).unwrap();
        assert_eq!(reloaded.categories(), catalog.categories());
    }
}
