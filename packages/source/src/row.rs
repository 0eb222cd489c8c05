//! Decoded CSV rows addressed by column name.

use std::collections::BTreeMap;
use std::sync::Arc;

/// Header row shared by every [`RawRow`] of one file.
#[derive(Debug, Default)]
pub struct Headers {
    names: Vec<String>,
    index: BTreeMap<String, usize>,
}

impl Headers {
    /// Builds the column index. When a column name repeats, the first
    /// occurrence wins.
    #[must_use]
    pub fn new(names: Vec<String>) -> Self {
        let mut index = BTreeMap::new();
        for (i, name) in names.iter().enumerate() {
            index.entry(name.clone()).or_insert(i);
        }
        Self { names, index }
    }

    /// Position of `column`, if present.
    #[must_use]
    pub fn position(&self, column: &str) -> Option<usize> {
        self.index.get(column).copied()
    }

    /// Whether the header contains `column`.
    #[must_use]
    pub fn contains(&self, column: &str) -> bool {
        self.index.contains_key(column)
    }

    /// Column names in file order.
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// One CSV record as a mapping of column name to string.
#[derive(Debug, Clone)]
pub struct RawRow {
    headers: Arc<Headers>,
    fields: Vec<String>,
    line: u64,
}

impl RawRow {
    /// Creates a row from already-decoded fields.
    #[must_use]
    pub const fn new(headers: Arc<Headers>, fields: Vec<String>, line: u64) -> Self {
        Self {
            headers,
            fields,
            line,
        }
    }

    /// Builds a standalone row from `(column, value)` pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let (names, fields): (Vec<String>, Vec<String>) = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .unzip();

        Self::new(Arc::new(Headers::new(names)), fields, 0)
    }

    /// Value of `column`, or `None` if the column does not exist or the
    /// record is short.
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&str> {
        self.headers
            .position(column)
            .and_then(|i| self.fields.get(i))
            .map(String::as_str)
    }

    /// 1-based line of the record in its file (0 for synthetic rows).
    #[must_use]
    pub const fn line(&self) -> u64 {
        self.line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn looks_up_fields_by_column_name() {
        let row = RawRow::from_pairs([("GEO_LEVEL", "Country"), ("DGUID", "2021A000011124")]);
        assert_eq!(row.get("DGUID"), Some("2021A000011124"));
        assert_eq!(row.get("GEO_LEVEL"), Some("Country"));
        assert_eq!(row.get("C1_COUNT_TOTAL"), None);
    }

    #[test]
    fn short_record_yields_none() {
        let headers = Arc::new(Headers::new(vec!["A".to_string(), "B".to_string()]));
        let row = RawRow::new(headers, vec!["1".to_string()], 2);
        assert_eq!(row.get("A"), Some("1"));
        assert_eq!(row.get("B"), None);
        assert_eq!(row.line(), 2);
    }
}
