//! Undo/Redo History
//!
//! Snapshot-based undo/redo over the whole application state. Each entry
//! holds a deep copy taken *before* a change; undoing swaps it back into the
//! live store and keeps the displaced live state for redo.

use std::cell::{Cell, Ref, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{EngineConfig, DEFAULT_HISTORY_CAPACITY, DEFAULT_HISTORY_JOURNAL_WINDOW};
use crate::error::{PomoflowError, Result};
use crate::history::journal::{HistoryJournal, JournalContents};
use crate::state::StateValue;

/// Top-level keys every snapshot must carry to be restorable.
pub const REQUIRED_DOMAINS: [&str; 2] = ["tasks", "projects"];

/// The live state the history captures from and restores into.
pub trait SnapshotTarget {
    /// Independent deep copy of the current live state.
    fn capture(&self) -> StateValue;

    /// Replace the live state with `snapshot` in a single step.
    ///
    /// With `domains`, only those top-level keys are replaced.
    fn apply(&self, snapshot: StateValue, domains: Option<&[String]>);
}

/// Extra information recorded with an entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// Top-level domains the change touched; empty means the whole state.
    #[serde(default)]
    pub affected_domains: Vec<String>,
}

/// A single snapshot in the history.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub label: String,
    pub snapshot: StateValue,
    pub metadata: EntryMetadata,
}

impl HistoryEntry {
    pub fn new(label: impl Into<String>, snapshot: StateValue, metadata: EntryMetadata) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            label: label.into(),
            snapshot,
            metadata,
        }
    }
}

/// Past and future stacks. `past` is bounded; its oldest entries are evicted.
#[derive(Debug, Default)]
pub struct HistoryStack {
    past: VecDeque<HistoryEntry>,
    future: Vec<HistoryEntry>,
}

impl HistoryStack {
    fn push_past(&mut self, entry: HistoryEntry, capacity: usize) {
        self.past.push_back(entry);
        while self.past.len() > capacity {
            if let Some(evicted) = self.past.pop_front() {
                debug!(entry = %evicted.id, label = %evicted.label, "Evicted oldest history entry");
            }
        }
    }

    pub fn past(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.past.iter()
    }

    pub fn future(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.future.iter()
    }
}

#[derive(Debug, Clone)]
pub struct HistoryConfig {
    /// Maximum number of undo levels.
    pub capacity: usize,

    /// Number of trailing entries written to the journal.
    pub journal_window: usize,

    pub required_domains: Vec<String>,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_HISTORY_CAPACITY,
            journal_window: DEFAULT_HISTORY_JOURNAL_WINDOW,
            required_domains: REQUIRED_DOMAINS.iter().map(|d| d.to_string()).collect(),
        }
    }
}

impl From<&EngineConfig> for HistoryConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            capacity: config.history_capacity,
            journal_window: config.history_journal_window,
            ..Self::default()
        }
    }
}

/// Manages undo/redo for the live store.
///
/// All methods take `&self`: observers notified during a restoration may call
/// back in, and those calls are rejected until the restoration completes.
pub struct HistoryManager {
    target: Rc<dyn SnapshotTarget>,
    config: HistoryConfig,
    stack: RefCell<HistoryStack>,
    paused: Cell<bool>,
    restoring: Cell<bool>,
    journal: Option<HistoryJournal>,
}

/// Holds the manager paused and restoring; restores both flags on drop.
struct RestoreGuard<'a> {
    manager: &'a HistoryManager,
    was_paused: bool,
}

impl<'a> RestoreGuard<'a> {
    fn engage(manager: &'a HistoryManager) -> Self {
        manager.restoring.set(true);
        let was_paused = manager.paused.replace(true);
        Self {
            manager,
            was_paused,
        }
    }
}

impl Drop for RestoreGuard<'_> {
    fn drop(&mut self) {
        self.manager.paused.set(self.was_paused);
        self.manager.restoring.set(false);
    }
}

impl HistoryManager {
    pub fn new(target: Rc<dyn SnapshotTarget>, config: HistoryConfig) -> Self {
        Self {
            target,
            config,
            stack: RefCell::new(HistoryStack::default()),
            paused: Cell::new(false),
            restoring: Cell::new(false),
            journal: None,
        }
    }

    /// Persist the trailing windows of both stacks to `journal` on every change.
    pub fn with_journal(mut self, journal: HistoryJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Reload both stacks from the journal. Any read or decode failure leaves
    /// the history empty. Returns the number of undo entries restored.
    pub fn load_journal(&self) -> usize {
        let Some(journal) = &self.journal else {
            return 0;
        };
        let contents = match journal.read() {
            Ok(contents) => contents,
            Err(e) => {
                debug!(error = %e, "History journal unreadable, starting empty");
                JournalContents::default()
            }
        };

        let mut stack = self.stack.borrow_mut();
        stack.past.clear();
        stack.future.clear();
        for entry in contents.past {
            if self.validate(&entry.snapshot).is_ok() {
                stack.push_past(entry, self.config.capacity);
            }
        }
        stack.future = contents
            .future
            .into_iter()
            .filter(|entry| self.validate(&entry.snapshot).is_ok())
            .collect();
        stack.past.len()
    }

    /// Capture the full state before a change.
    pub fn save_state(&self, label: &str) -> bool {
        self.capture_entry(label, EntryMetadata::default())
    }

    /// Capture the full state, recording which domains the change touches.
    /// Undoing this entry only restores those domains.
    pub fn save_state_for(&self, label: &str, domains: &[&str]) -> bool {
        let metadata = EntryMetadata {
            affected_domains: domains.iter().map(|d| d.to_string()).collect(),
        };
        self.capture_entry(label, metadata)
    }

    fn capture_entry(&self, label: &str, metadata: EntryMetadata) -> bool {
        if self.restoring.get() {
            warn!(label, "save_state rejected: restoration in progress");
            return false;
        }
        if self.paused.get() {
            debug!(label, "save_state skipped: history paused");
            return false;
        }

        let entry = HistoryEntry::new(label, self.target.capture(), metadata);
        debug!(entry = %entry.id, label, "Captured history entry");
        {
            let mut stack = self.stack.borrow_mut();
            stack.push_past(entry, self.config.capacity);
            stack.future.clear();
        }
        self.write_journal();
        true
    }

    /// Restore the most recent snapshot. Returns false when there is nothing
    /// to undo, a restoration is in flight, or the entry is corrupt.
    pub fn undo(&self) -> bool {
        if self.restoring.get() {
            warn!("Undo rejected: restoration in progress");
            return false;
        }
        let Some(entry) = self.stack.borrow_mut().past.pop_back() else {
            return false;
        };
        if !self.accept(&entry) {
            self.write_journal();
            return false;
        }

        let displaced = HistoryEntry::new(
            entry.label.clone(),
            self.target.capture(),
            entry.metadata.clone(),
        );
        info!(label = %entry.label, "Undo");
        self.restore(entry);
        self.stack.borrow_mut().future.push(displaced);
        self.write_journal();
        true
    }

    /// Re-apply the most recently undone state.
    pub fn redo(&self) -> bool {
        if self.restoring.get() {
            warn!("Redo rejected: restoration in progress");
            return false;
        }
        let Some(entry) = self.stack.borrow_mut().future.pop() else {
            return false;
        };
        if !self.accept(&entry) {
            self.write_journal();
            return false;
        }

        let displaced = HistoryEntry::new(
            entry.label.clone(),
            self.target.capture(),
            entry.metadata.clone(),
        );
        info!(label = %entry.label, "Redo");
        self.restore(entry);
        self.stack
            .borrow_mut()
            .push_past(displaced, self.config.capacity);
        self.write_journal();
        true
    }

    fn accept(&self, entry: &HistoryEntry) -> bool {
        match self.validate(&entry.snapshot) {
            Ok(()) => true,
            Err(e) => {
                warn!(entry = %entry.id, label = %entry.label, error = %e, "Discarding corrupt history entry");
                false
            }
        }
    }

    fn restore(&self, entry: HistoryEntry) {
        let _guard = RestoreGuard::engage(self);
        let domains = entry.metadata.affected_domains;
        if domains.is_empty() {
            self.target.apply(entry.snapshot, None);
        } else {
            self.target.apply(entry.snapshot, Some(&domains));
        }
    }

    /// Basic structural check: a record with every required top-level key.
    pub fn validate(&self, snapshot: &StateValue) -> Result<()> {
        let Some(fields) = snapshot.as_record() else {
            return Err(PomoflowError::Validation {
                reason: format!("snapshot root is a {}, expected a record", snapshot.kind()),
            });
        };
        let fields = fields.borrow();
        for key in &self.config.required_domains {
            if !fields.contains_key(key) {
                return Err(PomoflowError::Validation {
                    reason: format!("snapshot is missing '{}'", key),
                });
            }
        }
        Ok(())
    }

    fn write_journal(&self) {
        let Some(journal) = &self.journal else {
            return;
        };
        let stack = self.stack.borrow();
        let window = self.config.journal_window;
        let past: Vec<&HistoryEntry> =
            stack.past.iter().skip(stack.past.len().saturating_sub(window)).collect();
        let future: Vec<&HistoryEntry> =
            stack.future.iter().skip(stack.future.len().saturating_sub(window)).collect();
        if let Err(e) = journal.write(&past, &future) {
            warn!(error = %e, "Failed to write history journal");
        }
    }

    pub fn pause(&self) {
        self.paused.set(true);
    }

    pub fn resume(&self) {
        self.paused.set(false);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.get()
    }

    pub fn is_restoring(&self) -> bool {
        self.restoring.get()
    }

    pub fn can_undo(&self) -> bool {
        !self.stack.borrow().past.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.stack.borrow().future.is_empty()
    }

    pub fn undo_count(&self) -> usize {
        self.stack.borrow().past.len()
    }

    pub fn redo_count(&self) -> usize {
        self.stack.borrow().future.len()
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Read access to both stacks, for diagnostics and display.
    pub fn stack(&self) -> Ref<'_, HistoryStack> {
        self.stack.borrow()
    }

    /// Labels of undoable entries, most recent first.
    pub fn undo_labels(&self) -> Vec<String> {
        self.stack
            .borrow()
            .past
            .iter()
            .rev()
            .map(|e| e.label.clone())
            .collect()
    }

    /// Labels of redoable entries, most recently undone first.
    pub fn redo_labels(&self) -> Vec<String> {
        self.stack
            .borrow()
            .future
            .iter()
            .rev()
            .map(|e| e.label.clone())
            .collect()
    }

    /// Drop all undo/redo history.
    pub fn clear(&self) {
        {
            let mut stack = self.stack.borrow_mut();
            warn!(
                past = stack.past.len(),
                future = stack.future.len(),
                "Clearing undo/redo history"
            );
            stack.past.clear();
            stack.future.clear();
        }
        self.write_journal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Weak;
    use tempfile::tempdir;

    /// Minimal live store: a single root swapped wholesale.
    struct LiveState {
        root: RefCell<StateValue>,
        applied: Cell<usize>,
        on_apply: RefCell<Option<Box<dyn Fn()>>>,
    }

    impl LiveState {
        fn new() -> Rc<Self> {
            Rc::new(Self {
                root: RefCell::new(state_with_tasks(&[])),
                applied: Cell::new(0),
                on_apply: RefCell::new(None),
            })
        }

        fn task_count(&self) -> usize {
            let root = self.root.borrow();
            let tasks = root.get("tasks").unwrap();
            let count = tasks.as_list().unwrap().borrow().len();
            count
        }

        fn add_task(&self, id: &str) {
            let root = self.root.borrow();
            let tasks = root.get("tasks").unwrap();
            tasks
                .as_list()
                .unwrap()
                .borrow_mut()
                .push(StateValue::record([("id", StateValue::text(id))]));
        }
    }

    impl SnapshotTarget for LiveState {
        fn capture(&self) -> StateValue {
            self.root.borrow().deep_clone()
        }

        fn apply(&self, snapshot: StateValue, domains: Option<&[String]>) {
            match domains {
                None => *self.root.borrow_mut() = snapshot,
                Some(domains) => {
                    let root = self.root.borrow();
                    for domain in domains {
                        if let Some(value) = snapshot.get(domain) {
                            root.set_field(domain.clone(), value);
                        }
                    }
                }
            }
            self.applied.set(self.applied.get() + 1);
            if let Some(hook) = self.on_apply.borrow().as_ref() {
                hook();
            }
        }
    }

    fn state_with_tasks(ids: &[&str]) -> StateValue {
        StateValue::record([
            (
                "tasks",
                StateValue::list(
                    ids.iter()
                        .map(|id| StateValue::record([("id", StateValue::text(*id))])),
                ),
            ),
            ("projects", StateValue::list([])),
            ("settings", StateValue::record::<String>([])),
        ])
    }

    fn manager_for(live: &Rc<LiveState>) -> HistoryManager {
        HistoryManager::new(live.clone(), HistoryConfig::default())
    }

    #[test]
    fn test_new_manager_is_empty() {
        let live = LiveState::new();
        let manager = manager_for(&live);
        assert!(!manager.can_undo());
        assert!(!manager.can_redo());
        assert!(!manager.undo());
        assert!(!manager.redo());
    }

    #[test]
    fn test_undo_restores_previous_state() {
        let live = LiveState::new();
        let manager = manager_for(&live);
        let before = live.capture();

        assert!(manager.save_state("before create"));
        live.add_task("t1");
        assert_eq!(live.task_count(), 1);

        assert!(manager.undo());
        assert_eq!(live.task_count(), 0);
        assert_eq!(*live.root.borrow(), before);
        assert!(manager.can_redo());
    }

    #[test]
    fn test_redo_reapplies_undone_change() {
        let live = LiveState::new();
        let manager = manager_for(&live);

        manager.save_state("before create");
        live.add_task("t1");
        manager.undo();
        assert!(manager.redo());
        assert_eq!(live.task_count(), 1);
        assert!(manager.can_undo());
        assert!(!manager.can_redo());
    }

    #[test]
    fn test_save_after_undo_clears_future() {
        let live = LiveState::new();
        let manager = manager_for(&live);

        manager.save_state("one");
        live.add_task("t1");
        manager.undo();
        assert_eq!(manager.redo_count(), 1);

        manager.save_state("two");
        assert_eq!(manager.redo_count(), 0);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let live = LiveState::new();
        let manager = manager_for(&live);

        for i in 0..60 {
            manager.save_state(&format!("step {}", i));
        }
        assert_eq!(manager.undo_count(), 50);
        assert_eq!(manager.undo_labels().last().map(String::as_str), Some("step 10"));
    }

    #[test]
    fn test_paused_manager_does_not_capture() {
        let live = LiveState::new();
        let manager = manager_for(&live);

        manager.pause();
        assert!(!manager.save_state("ignored"));
        manager.resume();
        assert!(manager.save_state("kept"));
        assert_eq!(manager.undo_count(), 1);
    }

    #[test]
    fn test_restore_does_not_record_itself() {
        let live = LiveState::new();
        let manager = manager_for(&live);

        manager.save_state("a");
        live.add_task("t1");
        manager.undo();
        assert_eq!(manager.undo_count(), 0);
        assert!(!manager.is_paused());
        assert!(!manager.is_restoring());
    }

    #[test]
    fn test_reentrant_calls_during_restore_are_rejected() {
        let live = LiveState::new();
        let manager = Rc::new(manager_for(&live));
        let results: Rc<RefCell<Vec<bool>>> = Rc::new(RefCell::new(Vec::new()));

        let weak: Weak<HistoryManager> = Rc::downgrade(&manager);
        let seen = results.clone();
        *live.on_apply.borrow_mut() = Some(Box::new(move || {
            if let Some(manager) = weak.upgrade() {
                seen.borrow_mut().push(manager.save_state("from observer"));
                seen.borrow_mut().push(manager.undo());
                seen.borrow_mut().push(manager.redo());
            }
        }));

        manager.save_state("one");
        manager.save_state("two");
        live.add_task("t1");
        assert!(manager.undo());

        assert_eq!(*results.borrow(), vec![false, false, false]);
        assert_eq!(manager.undo_count(), 1);
        assert_eq!(manager.redo_count(), 1);
    }

    #[test]
    fn test_corrupt_entry_is_discarded() {
        let live = LiveState::new();
        let manager = manager_for(&live);
        live.add_task("t1");

        manager.stack.borrow_mut().past.push_back(HistoryEntry::new(
            "corrupt",
            StateValue::record([("tasks", StateValue::list([]))]),
            EntryMetadata::default(),
        ));

        assert!(!manager.undo());
        assert_eq!(live.task_count(), 1);
        assert_eq!(live.applied.get(), 0);
        assert!(!manager.can_undo());
    }

    #[test]
    fn test_partial_restore_only_touches_named_domains() {
        let live = LiveState::new();
        let manager = manager_for(&live);

        manager.save_state_for("before task edit", &["tasks"]);
        live.add_task("t1");
        live.root
            .borrow()
            .set_field("settings", StateValue::record([("theme", StateValue::text("dark"))]));

        assert!(manager.undo());
        assert_eq!(live.task_count(), 0);
        let theme = live.root.borrow().get("settings").and_then(|s| s.get("theme"));
        assert_eq!(theme.and_then(|t| t.as_str().map(String::from)).as_deref(), Some("dark"));
    }

    #[test]
    fn test_journal_round_trip() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("history.json");
        let live = LiveState::new();

        {
            let manager = manager_for(&live).with_journal(HistoryJournal::new(&path));
            for i in 0..25 {
                manager.save_state(&format!("step {}", i));
            }
        }

        let manager = manager_for(&live).with_journal(HistoryJournal::new(&path));
        assert_eq!(manager.load_journal(), 20);
        assert_eq!(manager.undo_labels().first().map(String::as_str), Some("step 24"));
        assert_eq!(manager.undo_labels().last().map(String::as_str), Some("step 5"));
    }

    #[test]
    fn test_redo_survives_reopen() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("history.json");
        let live = LiveState::new();

        {
            let manager = manager_for(&live).with_journal(HistoryJournal::new(&path));
            manager.save_state("add t1");
            live.add_task("t1");
            assert!(manager.undo());
        }
        assert_eq!(live.task_count(), 0);

        let manager = manager_for(&live).with_journal(HistoryJournal::new(&path));
        assert_eq!(manager.load_journal(), 0);
        assert_eq!(manager.redo_count(), 1);
        assert_eq!(manager.redo_labels(), vec!["add t1"]);
        assert!(manager.redo());
        assert_eq!(live.task_count(), 1);
    }

    #[test]
    fn test_unreadable_journal_falls_back_to_empty() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("history.json");
        std::fs::write(&path, "{ definitely not a journal").unwrap();

        let live = LiveState::new();
        let manager = manager_for(&live).with_journal(HistoryJournal::new(&path));
        assert_eq!(manager.load_journal(), 0);
        assert!(!manager.can_undo());
    }

    #[test]
    fn test_clear_drops_both_stacks() {
        let live = LiveState::new();
        let manager = manager_for(&live);
        manager.save_state("a");
        manager.save_state("b");
        live.add_task("t1");
        manager.undo();

        manager.clear();
        assert_eq!(manager.undo_count(), 0);
        assert_eq!(manager.redo_count(), 0);
    }
}
