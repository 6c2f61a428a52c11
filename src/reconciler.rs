//! Marker reconciliation.
//!
//! The display layer never redraws the whole map. After every store or search
//! change the reconciler compares the previously shown vehicles with the new
//! visible set and emits a [`Changeset`]: markers to add, markers to move or
//! restyle, and markers to drop. Unchanged vehicles produce nothing.

use std::collections::HashMap;

use serde::Serialize;

use crate::models::VehicleRecord;

pub type VisibleMap = HashMap<String, VehicleRecord>;

/// Replacement polyline for one vehicle's trail.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrailPatch {
    pub id: String,
    pub points: Vec<[f64; 2]>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Changeset {
    pub added: Vec<VehicleRecord>,
    pub updated: Vec<VehicleRecord>,
    pub removed: Vec<String>,
    /// Trails for every added or updated id. Removed ids drop their trail.
    pub trails: Vec<TrailPatch>,
}

impl Changeset {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    pub fn added_ids(&self) -> Vec<&str> {
        self.added.iter().map(|r| r.id.as_str()).collect()
    }

    pub fn updated_ids(&self) -> Vec<&str> {
        self.updated.iter().map(|r| r.id.as_str()).collect()
    }
}

/// Pure diff of two visible sets. Output lists are ordered by id.
pub fn diff(previous: &VisibleMap, next: &VisibleMap) -> Changeset {
    let mut changeset = Changeset::default();

    for (id, record) in next {
        match previous.get(id) {
            None => changeset.added.push(record.clone()),
            Some(before) if record.display_differs(before) => changeset.updated.push(record.clone()),
            Some(_) => {}
        }
    }
    changeset.removed = previous
        .keys()
        .filter(|id| !next.contains_key(*id))
        .cloned()
        .collect();

    changeset.added.sort_by(|a, b| a.id.cmp(&b.id));
    changeset.updated.sort_by(|a, b| a.id.cmp(&b.id));
    changeset.removed.sort();
    changeset
}

/// Remembers what the display currently shows.
#[derive(Debug, Default)]
pub struct MarkerReconciler {
    shown: VisibleMap,
}

impl MarkerReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Diff against the shown set, attach trails, then adopt `next` as shown.
    pub fn reconcile<F>(&mut self, next: Vec<VehicleRecord>, trail_of: F) -> Changeset
    where
        F: Fn(&str) -> Vec<[f64; 2]>,
    {
        let next: VisibleMap = next.into_iter().map(|r| (r.id.clone(), r)).collect();
        let mut changeset = diff(&self.shown, &next);

        changeset.trails = changeset
            .added
            .iter()
            .chain(changeset.updated.iter())
            .map(|record| TrailPatch {
                id: record.id.clone(),
                points: trail_of(&record.id),
            })
            .collect();

        self.shown = next;
        changeset
    }

    pub fn shown(&self) -> &VisibleMap {
        &self.shown
    }
}
