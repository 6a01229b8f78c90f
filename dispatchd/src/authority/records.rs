use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

/// A concurrent name -> value table.
///
/// Writers replace whole values under the write lock, so readers always see
/// either the previous or the next value, never a partial one. Keys are
/// stored lower-cased since resolution names are case-insensitive.
#[derive(Debug, Default)]
pub struct RecordTable {
    entries: RwLock<HashMap<String, String>>,
}

impl RecordTable {
    /// Insert or replace a value. Returns the previous value, if any.
    pub fn insert(&self, name: &str, value: &str) -> Option<String> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_ascii_lowercase(), value.to_string())
    }

    pub fn remove(&self, name: &str) -> Option<String> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&name.to_ascii_lowercase())
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&name.to_ascii_lowercase())
            .cloned()
    }

    /// Sorted copy of the table
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
