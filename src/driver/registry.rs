//! Entity Registry
//!
//! Per-entity records for volumes and snapshots. Each entry carries an
//! async serialization token held for the whole of an operation and a
//! record that can be read at any time without waiting on that token.

use super::model::{Snapshot, SnapshotState, Volume};
use crate::error::{Error, Result};
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Records kept in an [`EntityTable`]
pub trait Tracked: Clone + Send + Sync + 'static {
    /// Entity kind used in errors
    const KIND: &'static str;

    /// Whether the entity still exists (is not a tombstone)
    fn is_live(&self) -> bool;
}

impl Tracked for Volume {
    const KIND: &'static str = "Volume";

    fn is_live(&self) -> bool {
        self.state.is_live()
    }
}

impl Tracked for Snapshot {
    const KIND: &'static str = "Snapshot";

    fn is_live(&self) -> bool {
        self.state != SnapshotState::Deleted
    }
}

// =============================================================================
// Entries
// =============================================================================

/// One entity: serialization token plus current record
pub struct Entry<T> {
    token: Arc<Mutex<()>>,
    record: RwLock<T>,
}

/// Shared handle to an entry
pub type EntryRef<T> = Arc<Entry<T>>;

/// Proof that the holder owns an entity's serialization token
pub type OpGuard = OwnedMutexGuard<()>;

impl<T: fmt::Debug> fmt::Debug for Entry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("record", &*self.record.read())
            .finish_non_exhaustive()
    }
}

impl<T: Tracked> Entry<T> {
    fn new(record: T) -> Self {
        Self {
            token: Arc::new(Mutex::new(())),
            record: RwLock::new(record),
        }
    }

    /// Copy of the current record
    pub fn read(&self) -> T {
        self.record.read().clone()
    }

    /// Mutate the record and return the closure's result
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.record.write())
    }

    /// Wait for exclusive use of the entity
    pub async fn lock(&self) -> OpGuard {
        self.token.clone().lock_owned().await
    }

    /// Take exclusive use of the entity only if nobody holds it
    pub fn try_lock(&self) -> Option<OpGuard> {
        self.token.clone().try_lock_owned().ok()
    }
}

// =============================================================================
// Tables
// =============================================================================

/// Concurrent map of entity id to entry
pub struct EntityTable<T> {
    entries: DashMap<String, EntryRef<T>>,
}

impl<T: Tracked> Default for EntityTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Tracked> EntityTable<T> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn get(&self, id: &str) -> Option<EntryRef<T>> {
        self.entries.get(id).map(|e| e.value().clone())
    }

    /// Insert a record unless the id is already present; returns whichever
    /// entry ends up registered
    pub fn insert_if_absent(&self, id: &str, record: T) -> EntryRef<T> {
        self.entries
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Entry::new(record)))
            .value()
            .clone()
    }

    /// Register a new entity, already locked by the caller.
    ///
    /// A tombstone under the same id is replaced; a live entity is an
    /// [`Error::AlreadyExists`].
    pub fn begin_create(&self, id: &str, record: T) -> Result<(EntryRef<T>, OpGuard)> {
        let entry = Arc::new(Entry::new(record));
        let guard = entry.try_lock().ok_or_else(|| {
            Error::Internal(format!("fresh {} entry {} is already locked", T::KIND, id))
        })?;

        match self.entries.entry(id.to_string()) {
            MapEntry::Occupied(mut existing) => {
                if existing.get().record.read().is_live() {
                    return Err(Error::AlreadyExists {
                        kind: T::KIND.to_string(),
                        id: id.to_string(),
                    });
                }
                existing.insert(entry.clone());
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(entry.clone());
            }
        }
        Ok((entry, guard))
    }

    /// Drop an entry, unless it has since been replaced
    pub fn remove(&self, id: &str, entry: &EntryRef<T>) {
        self.entries.remove_if(id, |_, current| Arc::ptr_eq(current, entry));
    }

    /// Apply `f` to every record matching `predicate` and drop those entries
    pub fn remove_matching(&self, predicate: impl Fn(&T) -> bool, f: impl Fn(&mut T)) {
        self.entries.retain(|_, entry| {
            let mut record = entry.record.write();
            if predicate(&record) {
                f(&mut record);
                false
            } else {
                true
            }
        });
    }

    /// Copies of all live records
    pub fn live_records(&self) -> Vec<T> {
        self.entries
            .iter()
            .map(|e| e.value().read())
            .filter(T::is_live)
            .collect()
    }

    /// First live record matching `predicate`
    pub fn find_live(&self, predicate: impl Fn(&T) -> bool) -> Option<T> {
        self.entries
            .iter()
            .map(|e| e.value().read())
            .find(|record| record.is_live() && predicate(record))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::model::{ProvisioningMode, VolumeOrigin, VolumeState};
    use assert_matches::assert_matches;

    fn volume(id: &str) -> Volume {
        Volume::new(id, format!("tank/cinder/volume-{}", id), 1, ProvisioningMode::Thin, VolumeOrigin::Blank)
    }

    #[test]
    fn test_begin_create_rejects_live_duplicates() {
        let table = EntityTable::<Volume>::new();
        let (entry, _guard) = table.begin_create("a", volume("a")).unwrap();
        assert!(entry.try_lock().is_none());

        assert_matches!(
            table.begin_create("a", volume("a")),
            Err(Error::AlreadyExists { .. })
        );
    }

    #[test]
    fn test_begin_create_replaces_tombstones() {
        let table = EntityTable::<Volume>::new();
        let (entry, guard) = table.begin_create("a", volume("a")).unwrap();
        entry.update(|v| v.transition(VolumeState::Deleted));
        drop(guard);

        let (replacement, _guard) = table.begin_create("a", volume("a")).unwrap();
        assert!(!Arc::ptr_eq(&entry, &replacement));
        assert_eq!(table.get("a").unwrap().read().state, VolumeState::Creating);
        assert!(table.live_records().len() == 1);
    }

    #[test]
    fn test_remove_ignores_replaced_entries() {
        let table = EntityTable::<Volume>::new();
        let (stale, guard) = table.begin_create("a", volume("a")).unwrap();
        stale.update(|v| v.transition(VolumeState::Deleted));
        drop(guard);
        let (current, _guard) = table.begin_create("a", volume("a")).unwrap();

        table.remove("a", &stale);
        assert!(table.get("a").is_some());
        table.remove("a", &current);
        assert!(table.is_empty());
    }

    #[test]
    fn test_insert_if_absent_keeps_first() {
        let table = EntityTable::<Volume>::new();
        let first = table.insert_if_absent("a", volume("a"));
        let mut other = volume("a");
        other.size_gib = 99;
        let second = table.insert_if_absent("a", other);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.read().size_gib, 1);
    }

    #[tokio::test]
    async fn test_lock_serializes_and_try_lock_does_not_wait() {
        let table = EntityTable::<Volume>::new();
        let entry = table.insert_if_absent("a", volume("a"));

        let guard = entry.lock().await;
        assert!(entry.try_lock().is_none());
        // Records stay readable while an operation holds the token.
        assert_eq!(entry.read().id, "a");
        drop(guard);
        assert!(entry.try_lock().is_some());
    }

    #[test]
    fn test_remove_matching_ignores_serialization_tokens() {
        let table = EntityTable::<Volume>::new();
        let entry = table.insert_if_absent("a", volume("a"));
        table.insert_if_absent("b", volume("b"));

        let _held = tokio_test::block_on(entry.lock());
        table.remove_matching(|v| v.id == "a", |v| v.transition(VolumeState::Error));

        assert_eq!(entry.read().state, VolumeState::Error);
        assert_eq!(table.get("b").unwrap().read().state, VolumeState::Creating);
    }

    #[test]
    fn test_remove_matching_keeps_records_for_holders() {
        let table = EntityTable::<Volume>::new();
        let held = table.insert_if_absent("a", volume("a"));
        table.insert_if_absent("b", volume("b"));

        table.remove_matching(|v| v.id == "a", |v| v.transition(VolumeState::Deleted));

        assert!(table.get("a").is_none());
        assert_eq!(table.len(), 1);
        // Holders of the removed entry still see its final record.
        assert_eq!(held.read().state, VolumeState::Deleted);
    }

    #[test]
    fn test_entry_debug_shows_record() {
        let table = EntityTable::<Volume>::new();
        let entry = table.insert_if_absent("a", volume("a"));
        let rendered = format!("{:?}", entry);
        assert!(rendered.starts_with("Entry"));
        assert!(rendered.contains("tank/cinder/volume-a"));
    }

    #[test]
    fn test_find_live_skips_tombstones() {
        let table = EntityTable::<Volume>::new();
        let entry = table.insert_if_absent("a", volume("a"));
        table.insert_if_absent("b", volume("b"));
        entry.update(|v| v.transition(VolumeState::Deleted));

        assert!(table.find_live(|v| v.id == "a").is_none());
        assert!(table.find_live(|v| v.id == "b").is_some());
        assert_eq!(table.live_records().len(), 1);
    }
}
