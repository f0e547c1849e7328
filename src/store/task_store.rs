//! The live application state.
//!
//! `TaskStore` owns the root [`StateValue`] (`tasks`, `projects`,
//! `settings`), applies domain mutations to it, enqueues the matching
//! persistence operations and notifies subscribers. It is the snapshot
//! target of the history and the facade the sync coordinator merges through.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use serde_json::{Map as JsonMap, Value as Json};
use tracing::{debug, info};

use crate::error::{PomoflowError, Result};
use crate::history::SnapshotTarget;
use crate::persistence::{OperationKind, PersistenceQueue};
use crate::state::StateValue;
use crate::store::{item_id, number_id, Collection, DomainFacade, SETTINGS_KEY};

/// What changed, passed to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    Created { collection: Collection, id: String },
    Updated { collection: Collection, id: String },
    Deleted { collection: Collection, id: String },
    Settings,
    /// The state was replaced from a snapshot.
    Restored,
}

type Subscriber = Rc<dyn Fn(&StoreChange)>;

pub struct TaskStore {
    root: RefCell<StateValue>,
    queue: Option<PersistenceQueue>,
    subscribers: RefCell<Vec<Subscriber>>,
}

fn empty_root() -> StateValue {
    StateValue::record([
        ("tasks", StateValue::list([])),
        ("projects", StateValue::list([])),
        (SETTINGS_KEY, StateValue::record::<String>([])),
    ])
}

impl TaskStore {
    /// An empty store that persists nothing.
    pub fn new() -> Self {
        Self::with_root(empty_root(), None)
    }

    /// An empty store writing through `queue`.
    pub fn with_queue(queue: PersistenceQueue) -> Self {
        Self::with_root(empty_root(), Some(queue))
    }

    fn with_root(root: StateValue, queue: Option<PersistenceQueue>) -> Self {
        Self {
            root: RefCell::new(root),
            queue,
            subscribers: RefCell::new(Vec::new()),
        }
    }

    /// Rebuild the state from persisted records (`tasks/<id>`,
    /// `projects/<id>`, `settings`). Unknown keys are ignored.
    pub fn from_records(records: &BTreeMap<String, Json>, queue: Option<PersistenceQueue>) -> Self {
        let mut tasks = Vec::new();
        let mut projects = Vec::new();
        let mut settings = StateValue::record::<String>([]);

        for (key, value) in records {
            if key == SETTINGS_KEY {
                settings = StateValue::from_json(value);
                continue;
            }
            match Collection::parse_key(key) {
                Some((Collection::Tasks, _)) => tasks.push(StateValue::from_json(value)),
                Some((Collection::Projects, _)) => projects.push(StateValue::from_json(value)),
                None => debug!(key = %key, "Ignoring unknown persisted key"),
            }
        }

        info!(tasks = tasks.len(), projects = projects.len(), "Store rehydrated");
        let root = StateValue::record([
            ("tasks", StateValue::list(tasks)),
            ("projects", StateValue::list(projects)),
            (SETTINGS_KEY, settings),
        ]);
        Self::with_root(root, queue)
    }

    /// Register a callback run after every change.
    pub fn subscribe(&self, subscriber: impl Fn(&StoreChange) + 'static) {
        self.subscribers.borrow_mut().push(Rc::new(subscriber));
    }

    fn notify(&self, change: StoreChange) {
        let subscribers: Vec<Subscriber> = self.subscribers.borrow().clone();
        for subscriber in subscribers {
            subscriber(&change);
        }
    }

    fn enqueue(&self, kind: OperationKind, key: String, payload: Json) {
        if let Some(queue) = &self.queue {
            queue.queue_operation(kind, key, payload);
        }
    }

    /// Shared handle to one collection's list node.
    fn list(&self, collection: Collection) -> Result<StateValue> {
        let list = self
            .root
            .borrow()
            .get(collection.as_str())
            .filter(|v| v.as_list().is_some());
        list.ok_or_else(|| PomoflowError::Validation {
            reason: format!("store has no '{}' list", collection),
        })
    }

    fn position(list: &StateValue, id: &str) -> Option<usize> {
        let items = list.as_list()?.borrow();
        items
            .iter()
            .position(|item| state_item_id(item).as_deref() == Some(id))
    }

    pub fn item(&self, collection: Collection, id: &str) -> Option<Json> {
        let list = self.list(collection).ok()?;
        let index = Self::position(&list, id)?;
        let items = list.as_list()?.borrow();
        items.get(index).map(StateValue::to_json)
    }

    pub fn count(&self, collection: Collection) -> usize {
        self.list(collection)
            .ok()
            .and_then(|list| list.as_list().map(|items| items.borrow().len()))
            .unwrap_or(0)
    }

    /// Merge `fields` into the settings record.
    pub fn update_settings(&self, fields: Json) -> Result<()> {
        let Json::Object(fields) = fields else {
            return Err(PomoflowError::Validation {
                reason: "settings update must be an object".to_string(),
            });
        };
        let settings = {
            let root = self.root.borrow();
            match root.get(SETTINGS_KEY).filter(|s| s.as_record().is_some()) {
                Some(settings) => settings,
                None => {
                    let fresh = StateValue::record::<String>([]);
                    root.set_field(SETTINGS_KEY, fresh.clone());
                    fresh
                }
            }
        };
        for (key, value) in &fields {
            settings.set_field(key.clone(), StateValue::from_json(value));
        }
        self.enqueue(OperationKind::Save, SETTINGS_KEY.to_string(), settings.to_json());
        self.notify(StoreChange::Settings);
        Ok(())
    }

    /// Plain JSON view of the whole state.
    pub fn to_json(&self) -> Json {
        self.root.borrow().to_json()
    }

    /// Enqueue writes that bring persistence from `before` to the current state.
    fn persist_diff(&self, before: &StateValue, domains: Option<&[String]>) {
        let touched = |domain: &str| domains.map_or(true, |d| d.iter().any(|x| x == domain));
        let after = self.root.borrow().clone();

        for collection in Collection::ALL {
            if !touched(collection.as_str()) {
                continue;
            }
            let old = items_by_id(before.get(collection.as_str()));
            let new = items_by_id(after.get(collection.as_str()));
            for (id, item) in &new {
                if old.get(id) != Some(item) {
                    self.enqueue(OperationKind::Save, collection.key(id), item.clone());
                }
            }
            for id in old.keys().filter(|id| !new.contains_key(*id)) {
                self.enqueue(OperationKind::Delete, collection.key(id), Json::Null);
            }
        }

        if touched(SETTINGS_KEY) {
            let old = before.get(SETTINGS_KEY).map(|s| s.to_json());
            let new = after.get(SETTINGS_KEY).map(|s| s.to_json());
            if old != new {
                self.enqueue(
                    OperationKind::Save,
                    SETTINGS_KEY.to_string(),
                    new.unwrap_or(Json::Object(JsonMap::new())),
                );
            }
        }
    }
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Id of an item held as state. Numeric ids render like [`item_id`].
fn state_item_id(item: &StateValue) -> Option<String> {
    match item.get("id")? {
        StateValue::Text(s) if !s.is_empty() => Some(s),
        StateValue::Number(n) => Some(number_id(n)),
        _ => None,
    }
}

fn items_by_id(list: Option<StateValue>) -> BTreeMap<String, Json> {
    let Some(list) = list else {
        return BTreeMap::new();
    };
    let Some(items) = list.as_list() else {
        return BTreeMap::new();
    };
    let items = items.borrow();
    items
        .iter()
        .filter_map(|item| Some((state_item_id(item)?, item.to_json())))
        .collect()
}

impl DomainFacade for TaskStore {
    fn items(&self, collection: Collection) -> Vec<Json> {
        let Ok(list) = self.list(collection) else {
            return Vec::new();
        };
        let Some(items) = list.as_list() else {
            return Vec::new();
        };
        let items = items.borrow();
        items.iter().map(StateValue::to_json).collect()
    }

    fn settings(&self) -> Json {
        self.root
            .borrow()
            .get(SETTINGS_KEY)
            .map(|s| s.to_json())
            .unwrap_or_else(|| Json::Object(JsonMap::new()))
    }

    fn create_item(&self, collection: Collection, item: Json) -> Result<()> {
        if !item.is_object() {
            return Err(PomoflowError::Validation {
                reason: format!("{} item must be an object", collection),
            });
        }
        let id = item_id(&item).ok_or_else(|| PomoflowError::Validation {
            reason: format!("{} item has no id", collection),
        })?;
        let list = self.list(collection)?;
        if Self::position(&list, &id).is_some() {
            return Err(PomoflowError::DuplicateItem {
                collection: collection.to_string(),
                id,
            });
        }
        if let Some(items) = list.as_list() {
            items.borrow_mut().push(StateValue::from_json(&item));
        }

        debug!(collection = %collection, id = %id, "Created item");
        self.enqueue(OperationKind::Save, collection.key(&id), item);
        self.notify(StoreChange::Created { collection, id });
        Ok(())
    }

    fn update_item(&self, collection: Collection, id: &str, fields: Json) -> Result<()> {
        let Json::Object(fields) = fields else {
            return Err(PomoflowError::Validation {
                reason: format!("{} update must be an object", collection),
            });
        };
        let list = self.list(collection)?;
        let not_found = || PomoflowError::ItemNotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        };
        let index = Self::position(&list, id).ok_or_else(not_found)?;
        let item = list
            .as_list()
            .and_then(|items| items.borrow().get(index).cloned())
            .ok_or_else(not_found)?;

        for (key, value) in &fields {
            if key == "id" {
                continue;
            }
            item.set_field(key.clone(), StateValue::from_json(value));
        }

        debug!(collection = %collection, id, fields = fields.len(), "Updated item");
        self.enqueue(OperationKind::Update, collection.key(id), item.to_json());
        self.notify(StoreChange::Updated {
            collection,
            id: id.to_string(),
        });
        Ok(())
    }

    fn delete_item(&self, collection: Collection, id: &str) -> Result<()> {
        let list = self.list(collection)?;
        let index = Self::position(&list, id).ok_or_else(|| PomoflowError::ItemNotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        })?;
        if let Some(items) = list.as_list() {
            items.borrow_mut().remove(index);
        }

        debug!(collection = %collection, id, "Deleted item");
        self.enqueue(OperationKind::Delete, collection.key(id), Json::Null);
        self.notify(StoreChange::Deleted {
            collection,
            id: id.to_string(),
        });
        Ok(())
    }
}

impl SnapshotTarget for TaskStore {
    fn capture(&self) -> StateValue {
        self.root.borrow().deep_clone()
    }

    fn apply(&self, snapshot: StateValue, domains: Option<&[String]>) {
        let before = self.root.borrow().clone();
        match domains {
            None => {
                *self.root.borrow_mut() = snapshot;
            }
            Some(domains) => {
                // Detach the root so the untouched domains keep their nodes.
                let fields: Vec<(String, StateValue)> = before
                    .as_record()
                    .map(|f| f.borrow().iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                    .unwrap_or_default();
                let root = StateValue::record(fields);
                for domain in domains {
                    if let Some(value) = snapshot.get(domain) {
                        root.set_field(domain.clone(), value);
                    }
                }
                *self.root.borrow_mut() = root;
            }
        }
        self.persist_diff(&before, domains);
        self.notify(StoreChange::Restored);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{MemoryStore, QueueConfig};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::cell::Cell;
    use tokio::task::LocalSet;

    #[test]
    fn test_create_update_delete() {
        let store = TaskStore::new();
        store
            .create_item(Collection::Tasks, json!({"id": "t1", "title": "Write report"}))
            .unwrap();
        store
            .update_item(Collection::Tasks, "t1", json!({"done": true}))
            .unwrap();

        assert_eq!(
            store.item(Collection::Tasks, "t1"),
            Some(json!({"id": "t1", "title": "Write report", "done": true}))
        );

        store.delete_item(Collection::Tasks, "t1").unwrap();
        assert_eq!(store.count(Collection::Tasks), 0);
    }

    #[test]
    fn test_duplicate_and_missing_items_are_rejected() {
        let store = TaskStore::new();
        store.create_item(Collection::Projects, json!({"id": 7})).unwrap();

        assert!(matches!(
            store.create_item(Collection::Projects, json!({"id": 7})),
            Err(PomoflowError::DuplicateItem { .. })
        ));
        assert!(matches!(
            store.update_item(Collection::Projects, "8", json!({})),
            Err(PomoflowError::ItemNotFound { .. })
        ));
        assert!(matches!(
            store.create_item(Collection::Projects, json!({"name": "no id"})),
            Err(PomoflowError::Validation { .. })
        ));
        assert_eq!(store.items(Collection::Projects), vec![json!({"id": 7})]);
    }

    #[test]
    fn test_integral_float_id_matches_integer_id() {
        let store = TaskStore::new();
        store.create_item(Collection::Tasks, json!({"id": 1.0})).unwrap();

        assert!(store.item(Collection::Tasks, "1").is_some());
        assert!(matches!(
            store.create_item(Collection::Tasks, json!({"id": 1})),
            Err(PomoflowError::DuplicateItem { .. })
        ));
        store
            .update_item(Collection::Tasks, "1", json!({"title": "same task"}))
            .unwrap();
        store.delete_item(Collection::Tasks, "1").unwrap();
        assert_eq!(store.count(Collection::Tasks), 0);
    }

    #[test]
    fn test_subscribers_see_each_change() {
        let store = TaskStore::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        store.subscribe(move |change| sink.borrow_mut().push(change.clone()));

        store.create_item(Collection::Tasks, json!({"id": "a"})).unwrap();
        store.update_settings(json!({"theme": "dark"})).unwrap();

        assert_eq!(
            *seen.borrow(),
            vec![
                StoreChange::Created {
                    collection: Collection::Tasks,
                    id: "a".to_string()
                },
                StoreChange::Settings,
            ]
        );
    }

    #[test]
    fn test_apply_notifies_once() {
        let store = TaskStore::new();
        store.create_item(Collection::Tasks, json!({"id": "a"})).unwrap();
        let snapshot = store.capture();
        store.create_item(Collection::Tasks, json!({"id": "b"})).unwrap();

        let notified = Rc::new(Cell::new(0));
        let counter = notified.clone();
        store.subscribe(move |_| counter.set(counter.get() + 1));

        store.apply(snapshot, None);
        assert_eq!(notified.get(), 1);
        assert_eq!(store.items(Collection::Tasks), vec![json!({"id": "a"})]);
    }

    #[test]
    fn test_captured_snapshot_is_independent() {
        let store = TaskStore::new();
        store.create_item(Collection::Tasks, json!({"id": "a"})).unwrap();
        let snapshot = store.capture();

        store
            .update_item(Collection::Tasks, "a", json!({"title": "changed"}))
            .unwrap();
        let tasks = snapshot.get("tasks").unwrap();
        let first = tasks.as_list().unwrap().borrow()[0].clone();
        assert!(first.get("title").is_none());
    }

    #[test]
    fn test_from_records_rebuilds_collections() {
        let mut records = BTreeMap::new();
        records.insert("tasks/1".to_string(), json!({"id": "1"}));
        records.insert("projects/p".to_string(), json!({"id": "p"}));
        records.insert("settings".to_string(), json!({"theme": "light"}));
        records.insert("stray".to_string(), json!(true));

        let store = TaskStore::from_records(&records, None);
        assert_eq!(store.count(Collection::Tasks), 1);
        assert_eq!(store.count(Collection::Projects), 1);
        assert_eq!(store.settings(), json!({"theme": "light"}));
    }

    #[tokio::test]
    async fn test_mutations_and_restores_enqueue_writes() {
        LocalSet::new()
            .run_until(async {
                let primary = Rc::new(MemoryStore::new("primary"));
                let backup = Rc::new(MemoryStore::new("backup"));
                let queue = PersistenceQueue::new(QueueConfig::default(), primary.clone(), backup);
                let store = TaskStore::with_queue(queue.clone());

                store.create_item(Collection::Tasks, json!({"id": "a"})).unwrap();
                let before_b = store.capture();
                store.create_item(Collection::Tasks, json!({"id": "b"})).unwrap();
                queue.flush_queue().await.unwrap();
                assert_eq!(primary.len(), 2);

                // Restoring the earlier snapshot deletes "b" from storage.
                store.apply(before_b, None);
                assert_eq!(queue.pending_count(), 1);
                queue.flush_queue().await.unwrap();
                assert!(primary.get("tasks/b").is_none());
                assert!(primary.get("tasks/a").is_some());
            })
            .await;
    }

    #[test]
    fn test_partial_apply_keeps_other_domains() {
        let store = TaskStore::new();
        let snapshot = store.capture();
        store.create_item(Collection::Tasks, json!({"id": "a"})).unwrap();
        store.update_settings(json!({"theme": "dark"})).unwrap();

        store.apply(snapshot, Some(&["tasks".to_string()]));
        assert_eq!(store.count(Collection::Tasks), 0);
        assert_eq!(store.settings(), json!({"theme": "dark"}));
    }
}
