// src/compliance.rs

use crate::detector::GEAR_LABELS;
use crate::types::PersonEntity;
use std::collections::BTreeSet;

/// The canonical ordered list of gear every person must wear.
/// Process-wide constant in practice; a value type so tests can build
/// smaller sets.
#[derive(Debug, Clone)]
pub struct RequiredGear {
    items: Vec<String>,
}

impl Default for RequiredGear {
    fn default() -> Self {
        Self {
            items: GEAR_LABELS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl RequiredGear {
    #[cfg(test)]
    pub fn new(items: &[&str]) -> Self {
        Self {
            items: items.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn items(&self) -> &[String] {
        &self.items
    }

    /// Required items this person is not wearing, in canonical order.
    pub fn missing_for(&self, person: &PersonEntity) -> Vec<String> {
        self.items
            .iter()
            .filter(|item| !person.has_item(item))
            .cloned()
            .collect()
    }

    /// Union of missing items across all persons in a frame. One
    /// violation anywhere marks the whole frame; the aggregate reports
    /// risk, not per-person attribution. Callers must not pass an
    /// empty slice, the no-human sentinel is decided before this.
    pub fn missing_across(&self, persons: &[PersonEntity]) -> BTreeSet<String> {
        debug_assert!(!persons.is_empty());

        let mut all_missing = BTreeSet::new();
        for person in persons {
            all_missing.extend(self.missing_for(person));
        }
        all_missing
    }
}
