//! Reconciliation of a newer remote payload into the local store.
//!
//! Per collection, keyed by item id, over the union of local and remote ids:
//! remote-only items are created, local-only items deleted, and shared items
//! updated to the remote fields unless they are identical or the local copy
//! is itself newer.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value as Json;
use tracing::{debug, warn};

use crate::store::{item_id, item_timestamp, Collection, DomainFacade};
use crate::sync::provider::SyncPayload;

#[derive(Debug, Clone, PartialEq)]
pub enum MergeAction {
    Create { id: String, item: Json },
    Update { id: String, item: Json },
    Delete { id: String },
}

impl MergeAction {
    pub fn id(&self) -> &str {
        match self {
            MergeAction::Create { id, .. }
            | MergeAction::Update { id, .. }
            | MergeAction::Delete { id } => id,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectionPlan {
    pub actions: Vec<MergeAction>,
    /// Shared items left alone because they were identical.
    pub unchanged: usize,
    /// Shared items left alone because the local copy is newer.
    pub kept_local: usize,
}

impl CollectionPlan {
    /// Every id the plan considered: local and remote together.
    pub fn key_space(&self) -> usize {
        self.actions.len() + self.unchanged + self.kept_local
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergePlan {
    pub collections: BTreeMap<Collection, CollectionPlan>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub failed: usize,
}

fn index_by_id(collection: Collection, items: &[Json], side: &str) -> BTreeMap<String, Json> {
    let mut indexed = BTreeMap::new();
    for item in items {
        match item_id(item) {
            Some(id) => {
                indexed.insert(id, item.clone());
            }
            None => warn!(collection = %collection, side, "Skipping item without id"),
        }
    }
    indexed
}

/// Plan one collection. Creates follow the remote order.
pub fn plan_collection(collection: Collection, local: &[Json], remote: &[Json]) -> CollectionPlan {
    let local = index_by_id(collection, local, "local");
    let remote_index = index_by_id(collection, remote, "remote");
    let mut plan = CollectionPlan::default();
    let mut seen = BTreeSet::new();

    for item in remote {
        let Some(id) = item_id(item) else {
            continue;
        };
        if !seen.insert(id.clone()) {
            continue;
        }
        // The last duplicate in the remote list wins.
        let remote_item = &remote_index[&id];
        match local.get(&id) {
            None => plan.actions.push(MergeAction::Create {
                id,
                item: remote_item.clone(),
            }),
            Some(local_item) if local_item == remote_item => plan.unchanged += 1,
            Some(local_item) => {
                let local_newer = match (item_timestamp(local_item), item_timestamp(remote_item)) {
                    (Some(local_ts), Some(remote_ts)) => local_ts > remote_ts,
                    _ => false,
                };
                if local_newer {
                    plan.kept_local += 1;
                } else {
                    plan.actions.push(MergeAction::Update {
                        id,
                        item: remote_item.clone(),
                    });
                }
            }
        }
    }

    for id in local.keys().filter(|id| !remote_index.contains_key(*id)) {
        plan.actions.push(MergeAction::Delete { id: id.clone() });
    }
    plan
}

impl MergePlan {
    pub fn build(facade: &dyn DomainFacade, payload: &SyncPayload) -> Self {
        let collections = Collection::ALL
            .into_iter()
            .map(|c| (c, plan_collection(c, &facade.items(c), payload.items(c))))
            .collect();
        Self { collections }
    }

    pub fn is_empty(&self) -> bool {
        self.collections.values().all(|p| p.actions.is_empty())
    }

    /// Apply every action through the facade. A failed action is logged and
    /// the rest still run.
    pub fn apply(&self, facade: &dyn DomainFacade) -> MergeSummary {
        let mut summary = MergeSummary::default();
        for (collection, plan) in &self.collections {
            for action in &plan.actions {
                let result = match action {
                    MergeAction::Create { item, .. } => facade
                        .create_item(*collection, item.clone())
                        .map(|()| summary.created += 1),
                    MergeAction::Update { id, item } => facade
                        .update_item(*collection, id, item.clone())
                        .map(|()| summary.updated += 1),
                    MergeAction::Delete { id } => facade
                        .delete_item(*collection, id)
                        .map(|()| summary.deleted += 1),
                };
                if let Err(e) = result {
                    summary.failed += 1;
                    warn!(collection = %collection, id = action.id(), error = %e, "Merge action failed");
                }
            }
        }
        debug!(?summary, "Applied merge plan");
        summary
    }
}
