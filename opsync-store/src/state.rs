//! Store state and its version clock.
//!
//! Everything here is synchronous. The async store takes the lock, calls one
//! of these transitions, publishes a snapshot and releases the lock before
//! any suspension point.
//!
//! Every write takes a ticket from a monotonic clock and stamps the entry it
//! touched. A snapshot fetched at ticket `t` yields to any local write newer
//! than `t`, and a mutation's server response only lands if the entry still
//! carries that mutation's ticket.
//!
//! Removal tombstones only matter to a fetch that started before the removal,
//! so they are recorded while fetches are in flight and pruned as each one
//! ends. A feed insert that arrives while an add is in flight is held back
//! until the add resolves, since it may be that add's own echo.

use crate::echo::EchoWindow;
use opsync_core::{
    ChangeEvent, Entity, EntryKey, LocalId, NormalizedError, Record, RecordId,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Caller-supplied display order.
pub type Comparator<E> = Arc<dyn Fn(&E, &E) -> Ordering + Send + Sync>;

/// Load status of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LoadStatus {
    #[default]
    Idle,
    Loading,
    Ready,
    Errored,
}

/// One materialized row.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreEntry<E> {
    pub key: EntryKey,
    pub fields: E,
    /// Ticket of the latest write to this entry.
    pub version: u64,
}

impl<E> StoreEntry<E> {
    pub fn id(&self) -> Option<&RecordId> {
        self.key.record_id()
    }

    pub fn is_provisional(&self) -> bool {
        self.key.is_provisional()
    }
}

impl<E: Clone> StoreEntry<E> {
    /// The entry as a server record; `None` while provisional.
    pub fn to_record(&self) -> Option<Record<E>> {
        self.id().map(|id| Record::new(id.clone(), self.fields.clone()))
    }
}

/// What the UI renders.
#[derive(Debug, Clone)]
pub struct StoreSnapshot<E> {
    pub entries: Vec<StoreEntry<E>>,
    pub status: LoadStatus,
    pub last_error: Option<NormalizedError>,
}

impl<E> Default for StoreSnapshot<E> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            status: LoadStatus::Idle,
            last_error: None,
        }
    }
}

impl<E> StoreSnapshot<E> {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &RecordId) -> Option<&StoreEntry<E>> {
        self.entries.iter().find(|entry| entry.key.matches(id))
    }

    pub fn provisional_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_provisional()).count()
    }
}

/// Outcome of feeding one change event into the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    EchoSuppressed,
    /// Insert parked while an add is in flight.
    Held,
    Inserted,
    Updated,
    Deleted,
    Ignored,
}

/// Pre-mutation value kept for rollback.
#[derive(Debug, Clone)]
pub struct UpdateTicket<E> {
    pub ticket: u64,
    pub previous: Option<(E, u64)>,
}

#[derive(Debug, Clone)]
pub struct RemoveTicket<E> {
    pub ticket: u64,
    pub removed: Option<StoreEntry<E>>,
}

/// How a provisional entry was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Inserted; the feed echo is still expected.
    EchoArmed,
    /// Inserted; the echo already arrived and was held.
    EchoSeen,
    /// A reload or an earlier event already materialized the record.
    AlreadyPresent,
}

#[derive(Debug, Clone)]
struct HeldInsert<E> {
    record: Record<E>,
    deadline: Instant,
}

pub(crate) struct StoreState<E> {
    entries: Vec<StoreEntry<E>>,
    status: LoadStatus,
    last_error: Option<NormalizedError>,
    clock: u64,
    snapshot_version: u64,
    /// Tickets of fetches that have not landed yet.
    fetches: BTreeSet<u64>,
    /// Removals newer than some in-flight fetch.
    tombstones: HashMap<RecordId, u64>,
    /// Local removes awaiting the server, by ticket.
    removals: HashMap<RecordId, u64>,
    held: Vec<HeldInsert<E>>,
    echoes: EchoWindow,
    order: Option<Comparator<E>>,
}

impl<E: Entity> StoreState<E> {
    pub(crate) fn new(order: Option<Comparator<E>>, echo_grace: Duration) -> Self {
        Self {
            entries: Vec::new(),
            status: LoadStatus::Idle,
            last_error: None,
            clock: 0,
            snapshot_version: 0,
            fetches: BTreeSet::new(),
            tombstones: HashMap::new(),
            removals: HashMap::new(),
            held: Vec::new(),
            echoes: EchoWindow::new(echo_grace),
            order,
        }
    }

    pub(crate) fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    pub(crate) fn snapshot(&self) -> StoreSnapshot<E> {
        StoreSnapshot {
            entries: self.entries.clone(),
            status: self.status,
            last_error: self.last_error.clone(),
        }
    }

    pub(crate) fn status(&self) -> LoadStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: LoadStatus) {
        self.status = status;
    }

    pub(crate) fn record_error(&mut self, error: NormalizedError) {
        self.last_error = Some(error);
    }

    pub(crate) fn last_error(&self) -> Option<&NormalizedError> {
        self.last_error.as_ref()
    }

    pub(crate) fn entries(&self) -> &[StoreEntry<E>] {
        &self.entries
    }

    fn position(&self, id: &RecordId) -> Option<usize> {
        self.entries.iter().position(|entry| entry.key.matches(id))
    }

    fn position_local(&self, local: &LocalId) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| matches!(&entry.key, EntryKey::Provisional(l) if l == local))
    }

    pub(crate) fn contains(&self, id: &RecordId) -> bool {
        self.position(id).is_some()
    }

    fn has_provisional(&self) -> bool {
        self.entries.iter().any(StoreEntry::is_provisional)
    }

    fn mark_removed(&mut self, id: &RecordId, ticket: u64) {
        if !self.fetches.is_empty() {
            self.tombstones.insert(id.clone(), ticket);
        }
    }

    fn insert_sorted(&mut self, entry: StoreEntry<E>) {
        let at = match &self.order {
            Some(order) => self
                .entries
                .iter()
                .position(|existing| order(&existing.fields, &entry.fields) == Ordering::Greater)
                .unwrap_or(self.entries.len()),
            None => self.entries.len(),
        };
        self.entries.insert(at, entry);
    }

    /// Replace the fields at `index`, moving the entry if its sort key changed.
    fn rewrite_at(&mut self, index: usize, fields: E, version: u64) {
        let mut entry = self.entries.remove(index);
        entry.fields = fields;
        entry.version = version;
        if self.order.is_some() {
            self.insert_sorted(entry);
        } else {
            self.entries.insert(index, entry);
        }
    }

    // ------------------------------------------------------------------
    // Local mutations
    // ------------------------------------------------------------------

    pub(crate) fn insert_provisional(&mut self, fields: E) -> LocalId {
        let local = LocalId::generate();
        let version = self.tick();
        self.insert_sorted(StoreEntry {
            key: EntryKey::Provisional(local),
            fields,
            version,
        });
        local
    }

    pub(crate) fn discard_provisional(&mut self, local: &LocalId) -> bool {
        match self.position_local(local) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Swap a provisional entry for the server's record.
    ///
    /// A held insert for the same id is this add's echo and is consumed
    /// without arming the window.
    pub(crate) fn resolve_provisional(
        &mut self,
        local: &LocalId,
        record: Record<E>,
        now: Instant,
    ) -> Resolution {
        self.discard_provisional(local);
        let echoed = self.take_held(&record.id).is_some();
        if self.contains(&record.id) {
            return Resolution::AlreadyPresent;
        }
        let version = self.tick();
        self.tombstones.remove(&record.id);
        if !echoed {
            self.echoes.arm(record.id.clone(), now);
        }
        self.insert_sorted(StoreEntry {
            key: EntryKey::Persisted(record.id),
            fields: record.fields,
            version,
        });
        if echoed {
            Resolution::EchoSeen
        } else {
            Resolution::EchoArmed
        }
    }

    fn take_held(&mut self, id: &RecordId) -> Option<Record<E>> {
        let index = self.held.iter().position(|h| &h.record.id == id)?;
        Some(self.held.remove(index).record)
    }

    /// Materialize held inserts that can no longer be an echo: all of them
    /// once no add is in flight, otherwise those past their deadline.
    /// Returns the ids that were inserted.
    pub(crate) fn release_held(&mut self, now: Instant) -> Vec<RecordId> {
        if self.held.is_empty() {
            return Vec::new();
        }
        let in_flight = self.has_provisional();
        let (due, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.held)
            .into_iter()
            .partition(|h| !in_flight || h.deadline <= now);
        self.held = kept;

        let mut released = Vec::with_capacity(due.len());
        for HeldInsert { record, .. } in due {
            if self.contains(&record.id) {
                continue;
            }
            let version = self.tick();
            self.tombstones.remove(&record.id);
            released.push(record.id.clone());
            self.insert_sorted(StoreEntry {
                key: EntryKey::Persisted(record.id),
                fields: record.fields,
                version,
            });
        }
        released
    }

    pub(crate) fn apply_patch(&mut self, id: &RecordId, patch: &E::Patch) -> UpdateTicket<E> {
        let ticket = self.tick();
        let previous = self.position(id).map(|index| {
            let entry = &self.entries[index];
            let previous = (entry.fields.clone(), entry.version);
            let mut fields = entry.fields.clone();
            fields.apply_patch(patch);
            self.rewrite_at(index, fields, ticket);
            previous
        });
        UpdateTicket { ticket, previous }
    }

    /// Land the server response of an update, unless a newer write won.
    pub(crate) fn confirm_update(&mut self, record: Record<E>, ticket: u64) -> bool {
        match self.position(&record.id) {
            Some(index) if self.entries[index].version == ticket => {
                self.rewrite_at(index, record.fields, ticket);
                true
            }
            _ => false,
        }
    }

    /// Restore the pre-mutation value, unless a newer write won.
    pub(crate) fn revert_update(&mut self, id: &RecordId, update: UpdateTicket<E>) -> bool {
        let Some((fields, version)) = update.previous else {
            return false;
        };
        match self.position(id) {
            Some(index) if self.entries[index].version == update.ticket => {
                self.rewrite_at(index, fields, version);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn remove_local(&mut self, id: &RecordId) -> RemoveTicket<E> {
        let ticket = self.tick();
        self.removals.insert(id.clone(), ticket);
        self.mark_removed(id, ticket);
        let removed = self.position(id).map(|index| self.entries.remove(index));
        RemoveTicket { ticket, removed }
    }

    /// The server confirmed the removal taken at `ticket`.
    pub(crate) fn finish_removal(&mut self, id: &RecordId, ticket: u64) {
        if self.removals.get(id) == Some(&ticket) {
            self.removals.remove(id);
        }
    }

    /// Put a removed entry back, unless something newer touched the id.
    pub(crate) fn restore_removed(&mut self, id: &RecordId, removal: RemoveTicket<E>) -> bool {
        if self.removals.get(id) != Some(&removal.ticket) {
            return false;
        }
        self.removals.remove(id);
        if self.tombstones.get(id) == Some(&removal.ticket) {
            self.tombstones.remove(id);
        }
        match removal.removed {
            Some(entry) if !self.contains(id) => {
                self.insert_sorted(entry);
                true
            }
            _ => false,
        }
    }

    // ------------------------------------------------------------------
    // Snapshots and feed events
    // ------------------------------------------------------------------

    /// Take a ticket for a fetch that is about to start.
    pub(crate) fn begin_fetch(&mut self) -> u64 {
        let ticket = self.tick();
        self.fetches.insert(ticket);
        ticket
    }

    /// Forget the fetch at `ticket` and drop tombstones no remaining fetch
    /// can be older than. Safe to call twice.
    pub(crate) fn end_fetch(&mut self, ticket: u64) {
        self.fetches.remove(&ticket);
        match self.fetches.first().copied() {
            Some(oldest) => self.tombstones.retain(|_, t| *t > oldest),
            None => self.tombstones.clear(),
        }
    }

    /// Replace entries with a fetched snapshot taken at `ticket`.
    ///
    /// Returns `false` (and changes nothing) when a newer snapshot has
    /// already been applied. Either way the fetch at `ticket` is over.
    pub(crate) fn apply_snapshot(&mut self, records: Vec<Record<E>>, ticket: u64) -> bool {
        if ticket < self.snapshot_version {
            self.end_fetch(ticket);
            return false;
        }

        let mut previous: HashMap<RecordId, StoreEntry<E>> = HashMap::new();
        let mut carried: Vec<StoreEntry<E>> = Vec::new();
        for entry in self.entries.drain(..) {
            match entry.key.record_id() {
                Some(id) => {
                    previous.insert(id.clone(), entry);
                }
                // In-flight adds are owned by their mutation.
                None => carried.push(entry),
            }
        }

        let mut next: Vec<StoreEntry<E>> = Vec::with_capacity(records.len() + carried.len());
        let mut seen: HashSet<RecordId> = HashSet::new();
        for record in records {
            if !seen.insert(record.id.clone()) {
                continue;
            }
            if self.removals.contains_key(&record.id)
                || self.tombstones.get(&record.id).is_some_and(|t| *t > ticket)
            {
                continue;
            }
            match previous.remove(&record.id) {
                Some(local) if local.version > ticket => next.push(local),
                _ => next.push(StoreEntry {
                    key: EntryKey::Persisted(record.id),
                    fields: record.fields,
                    version: ticket,
                }),
            }
        }

        // Local writes newer than the snapshot that the server did not list.
        let mut newer: Vec<StoreEntry<E>> = previous
            .into_values()
            .filter(|entry| entry.version > ticket)
            .collect();
        newer.sort_by_key(|entry| entry.version);
        next.extend(newer);
        next.extend(carried);

        if let Some(order) = &self.order {
            next.sort_by(|a, b| order(&a.fields, &b.fields));
        }

        self.entries = next;
        self.snapshot_version = ticket;
        self.end_fetch(ticket);
        true
    }

    pub(crate) fn apply_event(&mut self, event: ChangeEvent<E>, now: Instant) -> EventOutcome {
        match event {
            ChangeEvent::Insert(record) => {
                if self.echoes.take(&record.id, now) {
                    return EventOutcome::EchoSuppressed;
                }
                if self.contains(&record.id) {
                    return EventOutcome::Ignored;
                }
                if self.has_provisional() {
                    let deadline = now + self.echoes.grace();
                    match self.held.iter_mut().find(|h| h.record.id == record.id) {
                        Some(held) => held.record = record,
                        None => self.held.push(HeldInsert { record, deadline }),
                    }
                    return EventOutcome::Held;
                }
                let version = self.tick();
                self.tombstones.remove(&record.id);
                self.insert_sorted(StoreEntry {
                    key: EntryKey::Persisted(record.id),
                    fields: record.fields,
                    version,
                });
                EventOutcome::Inserted
            }
            ChangeEvent::Update(record) => match self.position(&record.id) {
                Some(index) => {
                    let version = self.tick();
                    self.rewrite_at(index, record.fields, version);
                    EventOutcome::Updated
                }
                None => match self.held.iter_mut().find(|h| h.record.id == record.id) {
                    Some(held) => {
                        held.record = record;
                        EventOutcome::Held
                    }
                    None => EventOutcome::Ignored,
                },
            },
            ChangeEvent::Delete(id) => {
                let version = self.tick();
                self.mark_removed(&id, version);
                self.removals.remove(&id);
                self.take_held(&id);
                match self.position(&id) {
                    Some(index) => {
                        self.entries.remove(index);
                        EventOutcome::Deleted
                    }
                    None => EventOutcome::Ignored,
                }
            }
        }
    }

    pub(crate) fn sweep_echoes(&mut self, now: Instant) -> usize {
        self.echoes.sweep(now)
    }

    pub(crate) fn pending_echoes(&mut self, now: Instant) -> Vec<RecordId> {
        self.echoes.ids(now)
    }

    /// Echo entries still stored, expired or not.
    pub(crate) fn armed_echoes(&self) -> usize {
        self.echoes.len()
    }

    pub(crate) fn held_count(&self) -> usize {
        self.held.len()
    }

    pub(crate) fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }
}
