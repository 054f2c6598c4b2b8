//! Notification store.
//!
//! Newest-first list of received hook notifications, capped at
//! [`MAX_NOTIFICATIONS`] and persisted under [`NOTIFICATIONS_KEY`] after every
//! committed change.
//!
//! Mutations are two-phase. [`NotificationStore::apply_optimistic`] layers a
//! [`Patch`] over the committed list so readers see it at once;
//! [`NotificationStore::confirm`] folds it into the committed list and
//! persists. Both phases run the same `Patch::apply`, so they always converge.
//! The convenience mutators (`add`, `delete_*`) do both in one call.
//!
//! Storage failures never escape the store: they are logged and kept in
//! [`NotificationStore::error`].
//!
//! [`NotificationStore::open`] writes on the calling thread.
//! [`NotificationStore::open_background`] hands each committed snapshot to a
//! writer task that saves through `spawn_blocking`, so async callers never
//! wait on disk.

use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use hookwatch_protocol::NotificationRecord;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, warn};

use crate::storage::Storage;

pub const MAX_NOTIFICATIONS: usize = 100;
pub const NOTIFICATIONS_KEY: &str = "hook-notifications";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("failed to load notifications: {0}")]
    Load(String),

    #[error("failed to save notifications: {0}")]
    Save(String),
}

/// One store mutation. Deletes by grouping dimension match the same sentinel
/// keys the grouping engine uses, so records without a host, context or
/// session are still addressable.
#[derive(Debug, Clone, PartialEq)]
pub enum Patch {
    Add(NotificationRecord),
    DeleteOne(String),
    DeleteByContext(String),
    DeleteByHost(String),
    DeleteBySession(String),
    DeleteAll,
}

impl Patch {
    pub fn apply(&self, records: &mut Vec<NotificationRecord>) {
        match self {
            Patch::Add(record) => {
                // Redelivery after a reconnect keeps the first copy
                if records.iter().any(|r| r.id == record.id) {
                    return;
                }
                records.insert(0, record.clone());
                records.truncate(MAX_NOTIFICATIONS);
            }
            Patch::DeleteOne(id) => records.retain(|r| r.id != *id),
            Patch::DeleteByContext(context) => records.retain(|r| r.context_key() != context),
            Patch::DeleteByHost(host) => records.retain(|r| r.host_key() != host),
            Patch::DeleteBySession(session) => records.retain(|r| r.session_key() != session),
            Patch::DeleteAll => records.clear(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Patch::Add(_) => "add",
            Patch::DeleteOne(_) => "delete_one",
            Patch::DeleteByContext(_) => "delete_by_context",
            Patch::DeleteByHost(_) => "delete_by_host",
            Patch::DeleteBySession(_) => "delete_by_session",
            Patch::DeleteAll => "delete_all",
        }
    }
}

/// Token for a patch applied optimistically but not yet confirmed.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a pending patch must be confirmed or discarded"]
pub struct PendingPatch(u64);

struct Inner {
    committed: Vec<NotificationRecord>,
    pending: Vec<(u64, Patch)>,
    next_patch: u64,
    /// Cleared when the initial load could not read storage at all
    persist: bool,
}

impl Inner {
    fn view(&self) -> Vec<NotificationRecord> {
        let mut records = self.committed.clone();
        for (_, patch) in &self.pending {
            patch.apply(&mut records);
        }
        records
    }
}

type SharedError = Arc<Mutex<Option<StoreError>>>;

fn lock_error(error: &SharedError) -> std::sync::MutexGuard<'_, Option<StoreError>> {
    error.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Record the outcome of one save.
fn record_save(error: &SharedError, result: Result<(), String>) {
    let mut slot = lock_error(error);
    match result {
        Ok(()) => {
            if matches!(*slot, Some(StoreError::Save(_))) {
                *slot = None;
            }
        }
        Err(e) => {
            warn!(
                component = "store",
                event = "store.persist_failed",
                error = %e,
                "Failed to persist notifications"
            );
            *slot = Some(StoreError::Save(e));
        }
    }
}

enum PersistCommand {
    Save(String),
    Flush(oneshot::Sender<()>),
}

enum Writer {
    Inline,
    Background(mpsc::UnboundedSender<PersistCommand>),
}

/// Saves snapshots in order. Snapshots queued behind each other collapse to
/// the newest, since each one replaces the whole value.
struct PersistWriter {
    storage: Arc<dyn Storage>,
    rx: mpsc::UnboundedReceiver<PersistCommand>,
    error: SharedError,
}

impl PersistWriter {
    async fn run(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            let mut latest = None;
            let mut waiters = Vec::new();
            let mut next = Some(cmd);
            while let Some(cmd) = next {
                match cmd {
                    PersistCommand::Save(json) => latest = Some(json),
                    PersistCommand::Flush(done) => waiters.push(done),
                }
                next = self.rx.try_recv().ok();
            }

            if let Some(json) = latest {
                self.save(json).await;
            }
            for done in waiters {
                let _ = done.send(());
            }
        }
        debug!(component = "store", event = "store.writer_stopped");
    }

    async fn save(&self, json: String) {
        let storage = self.storage.clone();
        let result =
            tokio::task::spawn_blocking(move || storage.set(NOTIFICATIONS_KEY, &json)).await;
        match result {
            Ok(saved) => record_save(&self.error, saved.map_err(|e| e.to_string())),
            Err(e) => {
                error!(
                    component = "store",
                    event = "store.writer_panicked",
                    error = %e,
                );
                record_save(&self.error, Err(e.to_string()));
            }
        }
    }
}

pub struct NotificationStore {
    storage: Arc<dyn Storage>,
    writer: Writer,
    error: SharedError,
    inner: Mutex<Inner>,
    view: ArcSwap<Vec<NotificationRecord>>,
    revision: watch::Sender<u64>,
}

impl NotificationStore {
    /// Load the persisted collection.
    ///
    /// If storage cannot be read the store runs in memory only. If the stored
    /// value does not parse the store starts empty and overwrites it on the
    /// next change.
    pub fn open(storage: Arc<dyn Storage>) -> Self {
        Self::load(storage, Writer::Inline, Arc::default())
    }

    /// Like [`NotificationStore::open`], but saves run on a writer task.
    /// Must be called inside a tokio runtime.
    pub fn open_background(storage: Arc<dyn Storage>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let error = SharedError::default();
        let writer = PersistWriter {
            storage: storage.clone(),
            rx,
            error: error.clone(),
        };
        tokio::spawn(writer.run());
        Self::load(storage, Writer::Background(tx), error)
    }

    fn load(storage: Arc<dyn Storage>, writer: Writer, shared_error: SharedError) -> Self {
        let (committed, persist, error) = match storage.get(NOTIFICATIONS_KEY) {
            Ok(None) => (Vec::new(), true, None),
            Ok(Some(raw)) => match serde_json::from_str::<Vec<NotificationRecord>>(&raw) {
                Ok(mut records) => {
                    records.truncate(MAX_NOTIFICATIONS);
                    (records, true, None)
                }
                Err(e) => {
                    warn!(
                        component = "store",
                        event = "store.load_parse_failed",
                        error = %e,
                        "Stored notifications are unreadable, starting empty"
                    );
                    (Vec::new(), true, Some(StoreError::Load(e.to_string())))
                }
            },
            Err(e) => {
                warn!(
                    component = "store",
                    event = "store.load_failed",
                    error = %e,
                    "Storage unavailable, notifications will not be persisted"
                );
                (Vec::new(), false, Some(StoreError::Load(e.to_string())))
            }
        };

        debug!(
            component = "store",
            event = "store.loaded",
            count = committed.len(),
            persist,
        );

        *lock_error(&shared_error) = error;
        let view = ArcSwap::from_pointee(committed.clone());
        let (revision, _rx) = watch::channel(0);
        Self {
            storage,
            writer,
            error: shared_error,
            inner: Mutex::new(Inner {
                committed,
                pending: Vec::new(),
                next_patch: 0,
                persist,
            }),
            view,
            revision,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, inner: &Inner) {
        self.view.store(Arc::new(inner.view()));
        self.revision.send_modify(|r| *r += 1);
    }

    /// Runs under the inner lock, so saves are dispatched in commit order.
    fn persist(&self, inner: &Inner) {
        if !inner.persist {
            return;
        }
        let json = match serde_json::to_string(&inner.committed) {
            Ok(json) => json,
            Err(e) => return record_save(&self.error, Err(e.to_string())),
        };

        match &self.writer {
            Writer::Inline => {
                let result = self
                    .storage
                    .set(NOTIFICATIONS_KEY, &json)
                    .map_err(|e| e.to_string());
                record_save(&self.error, result);
            }
            Writer::Background(tx) => {
                if tx.send(PersistCommand::Save(json)).is_err() {
                    record_save(&self.error, Err("persistence writer stopped".to_string()));
                }
            }
        }
    }

    /// Wait until every committed change so far has been saved. Returns at
    /// once for an inline store.
    pub async fn flush(&self) {
        let Writer::Background(tx) = &self.writer else {
            return;
        };
        let (done, rx) = oneshot::channel();
        if tx.send(PersistCommand::Flush(done)).is_ok() {
            let _ = rx.await;
        }
    }

    // -- Two-phase mutation --------------------------------------------------

    /// Make `patch` visible immediately without committing it.
    pub fn apply_optimistic(&self, patch: Patch) -> PendingPatch {
        let mut inner = self.lock();
        inner.next_patch += 1;
        let id = inner.next_patch;
        inner.pending.push((id, patch));
        self.publish(&inner);
        PendingPatch(id)
    }

    /// Commit a pending patch and persist the result.
    pub fn confirm(&self, pending: PendingPatch) {
        let mut inner = self.lock();
        let Some(pos) = inner.pending.iter().position(|(id, _)| *id == pending.0) else {
            return;
        };
        let (_, patch) = inner.pending.remove(pos);
        patch.apply(&mut inner.committed);
        debug!(
            component = "store",
            event = "store.committed",
            patch = patch.name(),
            count = inner.committed.len(),
        );
        self.persist(&inner);
        self.publish(&inner);
    }

    /// Drop a pending patch; the view reverts to committed state plus any
    /// other pending patches.
    pub fn discard(&self, pending: PendingPatch) {
        let mut inner = self.lock();
        inner.pending.retain(|(id, _)| *id != pending.0);
        self.publish(&inner);
    }

    /// Apply and confirm. Returns how many records the view lost.
    fn mutate(&self, patch: Patch) -> usize {
        let before = self.len();
        let pending = self.apply_optimistic(patch);
        self.confirm(pending);
        before.saturating_sub(self.len())
    }

    // -- Operations ----------------------------------------------------------

    /// Prepend a record, evicting the oldest past the cap. Duplicate ids are
    /// ignored.
    pub fn add(&self, record: NotificationRecord) {
        self.mutate(Patch::Add(record));
    }

    pub fn delete_one(&self, id: &str) -> usize {
        self.mutate(Patch::DeleteOne(id.to_string()))
    }

    pub fn delete_by_context(&self, context: &str) -> usize {
        self.mutate(Patch::DeleteByContext(context.to_string()))
    }

    pub fn delete_by_host(&self, hostname: &str) -> usize {
        self.mutate(Patch::DeleteByHost(hostname.to_string()))
    }

    pub fn delete_by_session(&self, session_id: &str) -> usize {
        self.mutate(Patch::DeleteBySession(session_id.to_string()))
    }

    pub fn delete_all(&self) -> usize {
        self.mutate(Patch::DeleteAll)
    }

    // -- Reads ---------------------------------------------------------------

    /// Current view (committed plus pending), newest first. Lock-free.
    pub fn snapshot(&self) -> Arc<Vec<NotificationRecord>> {
        self.view.load_full()
    }

    pub fn len(&self) -> usize {
        self.view.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn error(&self) -> Option<StoreError> {
        lock_error(&self.error).clone()
    }

    /// Bumped on every visible change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }
}
