use std::collections::{BTreeMap, HashSet};

use tracing::{trace, warn};

use marksync_core::{feed::FeedEvent, ids::*, record::{self, Bookmark}};

/// What a single store application did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Inserted,
    Replaced,
    Removed,
    /// Identical record already present.
    Unchanged,
    /// Incoming revision older than the stored one.
    Stale,
    /// Record owned by another subject, or no subject active.
    Foreign,
    /// Id was removed earlier in this session.
    Tombstoned,
    /// Removal of an id that was not present.
    Absent,
}

impl ApplyOutcome {
    pub fn changed(self) -> bool {
        matches!(self, Self::Inserted | Self::Replaced | Self::Removed)
    }
}

/// Authoritative id → record mapping for the active subject.
///
/// Ids removed during a session stay tombstoned until the next activation,
/// so late or reordered upserts for them are refused. The remote store never
/// reuses ids, which makes this safe.
#[derive(Debug, Default)]
pub struct CollectionStore {
    owner: Option<SubjectId>,
    records: BTreeMap<BookmarkId, Bookmark>,
    tombstones: HashSet<BookmarkId>,
}

impl CollectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn owner(&self) -> Option<SubjectId> {
        self.owner
    }

    /// Start a fresh session for `owner`, dropping everything held before.
    pub fn activate(&mut self, owner: SubjectId) {
        self.clear();
        self.owner = Some(owner);
    }

    pub fn clear(&mut self) {
        self.owner = None;
        self.records.clear();
        self.tombstones.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: BookmarkId) -> Option<&Bookmark> {
        self.records.get(&id)
    }

    pub fn contains(&self, id: BookmarkId) -> bool {
        self.records.contains_key(&id)
    }

    pub fn records(&self) -> impl Iterator<Item = &Bookmark> {
        self.records.values()
    }

    pub fn snapshot(&self) -> Vec<Bookmark> {
        self.records.values().cloned().collect()
    }

    pub fn digest(&self) -> [u8; 32] {
        record::digest(self.records.values())
    }

    /// Insert or replace by id, last revision wins.
    pub fn upsert(&mut self, record: Bookmark) -> ApplyOutcome {
        if self.owner != Some(record.owner_id) {
            warn!(id = %record.id, owner = %record.owner_id, "dropping record of foreign owner");
            return ApplyOutcome::Foreign;
        }
        if self.tombstones.contains(&record.id) {
            trace!(id = %record.id, "upsert refused for removed id");
            return ApplyOutcome::Tombstoned;
        }
        match self.records.get(&record.id) {
            None => {
                self.records.insert(record.id, record);
                ApplyOutcome::Inserted
            }
            Some(existing) if record.revision < existing.revision => {
                trace!(id = %record.id, incoming = %record.revision, stored = %existing.revision, "stale upsert ignored");
                ApplyOutcome::Stale
            }
            Some(existing) if *existing == record => ApplyOutcome::Unchanged,
            Some(_) => {
                self.records.insert(record.id, record);
                ApplyOutcome::Replaced
            }
        }
    }

    /// Idempotent. The id is tombstoned either way.
    pub fn remove(&mut self, id: BookmarkId) -> ApplyOutcome {
        self.tombstones.insert(id);
        match self.records.remove(&id) {
            Some(_) => ApplyOutcome::Removed,
            None => ApplyOutcome::Absent,
        }
    }

    pub fn apply(&mut self, event: &FeedEvent) -> ApplyOutcome {
        match event {
            FeedEvent::Insert(record) | FeedEvent::Update(record) => self.upsert(record.clone()),
            FeedEvent::Delete { id } => self.remove(*id),
        }
    }

    /// Replace the whole mapping with a fresh fetch result. Foreign and
    /// tombstoned records are skipped; returns how many were kept.
    pub fn replace_all(&mut self, records: Vec<Bookmark>) -> usize {
        self.records.clear();
        let mut kept = 0;
        for record in records {
            if self.upsert(record) == ApplyOutcome::Inserted {
                kept += 1;
            }
        }
        kept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marksync_core::hlc::Hlc;

    fn owner() -> SubjectId {
        SubjectId::from_bytes([1; 32])
    }

    fn record(n: u128, revision: u64) -> Bookmark {
        Bookmark {
            id: BookmarkId::from_u128(n),
            title: format!("Title {n}"),
            url: format!("https://example.com/{n}"),
            owner_id: owner(),
            created_at: Hlc::new(n as u64, 0),
            revision: Hlc::new(revision, 0),
        }
    }

    fn active() -> CollectionStore {
        let mut store = CollectionStore::new();
        store.activate(owner());
        store
    }

    #[test]
    fn insert_event_twice_is_idempotent() {
        let mut store = active();
        let event = FeedEvent::Insert(record(1, 1));
        assert_eq!(store.apply(&event), ApplyOutcome::Inserted);
        let digest = store.digest();
        assert_eq!(store.apply(&event), ApplyOutcome::Unchanged);
        assert_eq!(store.digest(), digest);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn update_for_absent_id_inserts() {
        let mut store = active();
        assert_eq!(store.apply(&FeedEvent::Update(record(1, 1))), ApplyOutcome::Inserted);
        assert!(store.contains(BookmarkId::from_u128(1)));
    }

    #[test]
    fn older_revision_is_stale() {
        let mut store = active();
        let mut newer = record(1, 5);
        newer.title = "Renamed".into();
        store.upsert(newer.clone());
        assert_eq!(store.upsert(record(1, 3)), ApplyOutcome::Stale);
        assert_eq!(store.get(newer.id), Some(&newer));
    }

    #[test]
    fn delete_of_absent_id_is_noop() {
        let mut store = active();
        store.upsert(record(2, 1));
        let before = store.digest();
        let event = FeedEvent::Delete { id: BookmarkId::from_u128(1) };
        assert_eq!(store.apply(&event), ApplyOutcome::Absent);
        assert_eq!(store.digest(), before);
    }

    #[test]
    fn removed_id_is_not_resurrected() {
        let mut store = active();
        store.upsert(record(1, 1));
        assert_eq!(store.remove(BookmarkId::from_u128(1)), ApplyOutcome::Removed);
        assert_eq!(store.apply(&FeedEvent::Insert(record(1, 1))), ApplyOutcome::Tombstoned);
        assert_eq!(store.apply(&FeedEvent::Update(record(1, 9))), ApplyOutcome::Tombstoned);
        assert!(store.is_empty());
    }

    #[test]
    fn foreign_records_are_dropped() {
        let mut store = active();
        let mut foreign = record(1, 1);
        foreign.owner_id = SubjectId::from_bytes([2; 32]);
        assert_eq!(store.upsert(foreign), ApplyOutcome::Foreign);
        assert!(store.is_empty());

        let mut inactive = CollectionStore::new();
        assert_eq!(inactive.upsert(record(1, 1)), ApplyOutcome::Foreign);
    }

    #[test]
    fn replace_all_skips_tombstones_and_foreign() {
        let mut store = active();
        store.upsert(record(9, 1));
        store.remove(BookmarkId::from_u128(1));

        let mut foreign = record(3, 1);
        foreign.owner_id = SubjectId::from_bytes([2; 32]);
        let kept = store.replace_all(vec![record(1, 1), record(2, 1), foreign]);

        assert_eq!(kept, 1);
        let ids: Vec<_> = store.records().map(|r| r.id).collect();
        assert_eq!(ids, vec![BookmarkId::from_u128(2)]);
    }

    #[test]
    fn activate_resets_tombstones() {
        let mut store = active();
        store.remove(BookmarkId::from_u128(1));
        store.activate(owner());
        assert_eq!(store.upsert(record(1, 1)), ApplyOutcome::Inserted);
    }
}
