// src/association.rs

use crate::types::{Detection, PersonEntity};
use tracing::debug;

/// Assigns each gear detection to the person whose box contains its
/// center. Persons are scanned in detection order and the first match
/// wins, so an item is never credited to more than one person even
/// when boxes overlap. Items whose center lands in nobody's box are
/// dropped.
///
/// O(items x persons); per-frame cardinalities are small enough that
/// no spatial index is warranted.
pub fn associate(persons: &mut [PersonEntity], items: &[Detection]) {
    let mut dropped = 0usize;

    for item in items {
        let (cx, cy) = item.bbox.center();

        match persons.iter_mut().find(|p| p.bbox.contains(cx, cy)) {
            Some(person) => person.items_present.push(item.label.clone()),
            None => dropped += 1,
        }
    }

    if dropped > 0 {
        debug!("{} gear item(s) matched no person and were dropped", dropped);
    }
}
