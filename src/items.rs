//! Numeric item id to unique-name lookup.
//!
//! History requests reference items by their numeric index; orders reference
//! them by unique name (`T4_BAG`). The catalog maps one onto the other using
//! the community `items.json` dump. It is a plain value passed by reference
//! into the classifier, so tests can substitute a handful of entries.
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

#[derive(Debug, Deserialize)]
struct ItemEntry {
    #[serde(rename = "Index")]
    index: String,
    #[serde(rename = "UniqueName")]
    unique_name: String,
}

/// Id → unique-name lookup service.
#[derive(Debug, Default, Clone)]
pub struct ItemCatalog {
    id_to_name: HashMap<i64, String>,
}

impl ItemCatalog {
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (i64, String)>,
    {
        Self { id_to_name: entries.into_iter().collect() }
    }

    /// Load an `items.json` dump: an array of objects carrying at least
    /// `Index` (stringified integer) and `UniqueName`. Entries that fail to
    /// parse are skipped.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let entries: Vec<serde_json::Value> =
            serde_json::from_reader(reader).context("parse items.json")?;
        let mut id_to_name = HashMap::with_capacity(entries.len());
        for raw in entries {
            let Ok(entry) = serde_json::from_value::<ItemEntry>(raw) else {
                continue;
            };
            if let Ok(idx) = entry.index.parse::<i64>() {
                id_to_name.insert(idx, entry.unique_name);
            }
        }
        Ok(Self { id_to_name })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
        Self::from_reader(BufReader::new(file))
    }

    pub fn len(&self) -> usize {
        self.id_to_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_name.is_empty()
    }

    /// Resolve an id, falling back to the decimal id for unknown items.
    pub fn name_for(&self, item_id: i64) -> String {
        self.id_to_name
            .get(&item_id)
            .cloned()
            .unwrap_or_else(|| item_id.to_string())
    }
}
