use dashmap::DashMap;
use tracing::info;

use crate::taxonomy::{FeatureNameEntry, Taxonomy};

/// Append-only log of feature codes discovered during a run.
///
/// Responses may be parsed concurrently; registration is keyed by code, so
/// racing registrations of the same code keep the first entry and only one
/// caller sees it as new.
pub struct FeatureRegistry {
    known: DashMap<String, FeatureNameEntry>,
    discovered: DashMap<String, FeatureNameEntry>,
}

impl FeatureRegistry {
    pub fn from_taxonomy(taxonomy: &Taxonomy) -> Self {
        let known = DashMap::new();
        for feature in &taxonomy.features {
            known.insert(feature.code.clone(), feature.clone());
        }
        Self {
            known,
            discovered: DashMap::new(),
        }
    }

    pub fn is_known(&self, code: &str) -> bool {
        self.known.contains_key(code) || self.discovered.contains_key(code)
    }

    /// Record a feature code. Returns `true` only for the first registration
    /// of a code unknown to the taxonomy snapshot.
    pub fn register(&self, entry: FeatureNameEntry) -> bool {
        if self.known.contains_key(&entry.code) {
            return false;
        }
        match self.discovered.entry(entry.code.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                info!(code = %entry.code, module = ?entry.suggested_module, "Discovered new feature name");
                slot.insert(entry);
                true
            }
        }
    }

    /// Features discovered in this run, sorted by code.
    pub fn discovered(&self) -> Vec<FeatureNameEntry> {
        let mut entries: Vec<FeatureNameEntry> =
            self.discovered.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| a.code.cmp(&b.code));
        entries
    }
}
