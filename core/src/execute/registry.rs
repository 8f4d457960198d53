use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use arrow_schema::SchemaRef;
use duckdb::InterruptHandle;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, ServerError};
use crate::execute::engine::EngineConnection;
use crate::model::identity::Identity;

/// A prepared statement held alive across RPCs. The engine connection is
/// pinned for the lifetime of the handle so interrupts and session state
/// stay attached to the statement; it returns to the pool on disposal.
pub struct PreparedStatementHandle {
    pub id: Uuid,
    pub sql: String,
    pub owner: String,
    pub schema: SchemaRef,
    pub created_at: SystemTime,
    pub conn: Mutex<EngineConnection>,
}

/// Cancellation state for one executing FlightInfo. All endpoints of a split
/// plan share a single handle; cancelling it interrupts every in-flight
/// shard. The entry survives cancellation as a tombstone so that streams
/// opened afterwards fail with a cancelled status instead of re-executing.
pub struct RunningQueryHandle {
    pub id: Uuid,
    pub owner: String,
    cancelled: AtomicBool,
    active_streams: AtomicUsize,
    interrupts: Mutex<Vec<Arc<InterruptHandle>>>,
}

impl RunningQueryHandle {
    fn new(id: Uuid, owner: String) -> Self {
        Self {
            id,
            owner,
            cancelled: AtomicBool::new(false),
            active_streams: AtomicUsize::new(0),
            interrupts: Mutex::new(vec![]),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Registers the interrupt hook of a connection about to execute this
    /// query. Fails when the query was already cancelled.
    pub fn attach_interrupt(&self, handle: Arc<InterruptHandle>) -> Result<()> {
        let mut interrupts = self.interrupts.lock().expect("interrupt lock poisoned");
        if self.is_cancelled() {
            return Err(ServerError::Cancelled);
        }
        interrupts.push(handle);
        Ok(())
    }

    /// Signals cancellation. Idempotent; later calls are no-ops.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut interrupts = self.interrupts.lock().expect("interrupt lock poisoned");
        for handle in interrupts.drain(..) {
            handle.interrupt();
        }
    }
}

#[derive(Clone)]
pub enum HandleEntry {
    Prepared(Arc<PreparedStatementHandle>),
    Query(Arc<RunningQueryHandle>),
}

impl HandleEntry {
    fn owner(&self) -> &str {
        match self {
            HandleEntry::Prepared(p) => &p.owner,
            HandleEntry::Query(q) => &q.owner,
        }
    }
}

/// Process-wide registry of server-resident handles, keyed by the UUIDs
/// embedded in tickets and action payloads. A lookup concurrent with a
/// dispose may observe either the entry or its absence, never a dangling
/// reference.
#[derive(Default)]
pub struct HandleRegistry {
    entries: RwLock<HashMap<Uuid, HandleEntry>>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_prepared(
        &self,
        sql: String,
        owner: &Identity,
        schema: SchemaRef,
        conn: EngineConnection,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let handle = PreparedStatementHandle {
            id,
            sql,
            owner: owner.user.clone(),
            schema,
            created_at: SystemTime::now(),
            conn: Mutex::new(conn),
        };
        self.entries
            .write()
            .expect("registry lock poisoned")
            .insert(id, HandleEntry::Prepared(Arc::new(handle)));
        debug!("registered prepared statement {id}");
        id
    }

    /// Fetches the prepared statement `id`, verifying the requester owns it.
    /// Cross-user access is an authorization failure, not a missing handle.
    pub fn get_prepared(
        &self,
        id: Uuid,
        identity: &Identity,
    ) -> Result<Arc<PreparedStatementHandle>> {
        match self.get(id, identity)? {
            HandleEntry::Prepared(p) => Ok(p),
            HandleEntry::Query(_) => Err(ServerError::UnknownHandle(format!(
                "handle {id} is not a prepared statement"
            ))),
        }
    }

    fn get(&self, id: Uuid, identity: &Identity) -> Result<HandleEntry> {
        let entries = self.entries.read().expect("registry lock poisoned");
        let entry = entries
            .get(&id)
            .ok_or_else(|| ServerError::UnknownHandle(format!("no handle with id {id}")))?;
        if entry.owner() != identity.user {
            return Err(ServerError::Unauthorized(format!(
                "handle {id} is not owned by {}",
                identity.user
            )));
        }
        Ok(entry.clone())
    }

    pub fn remove(&self, id: Uuid) -> Option<HandleEntry> {
        let removed = self
            .entries
            .write()
            .expect("registry lock poisoned")
            .remove(&id);
        if removed.is_some() {
            debug!("disposed handle {id}");
        }
        removed
    }

    fn query_entry(&self, id: Uuid, identity: &Identity) -> Result<Arc<RunningQueryHandle>> {
        let mut entries = self.entries.write().expect("registry lock poisoned");
        let entry = entries
            .entry(id)
            .or_insert_with(|| {
                HandleEntry::Query(Arc::new(RunningQueryHandle::new(id, identity.user.clone())))
            })
            .clone();
        drop(entries);
        match entry {
            HandleEntry::Query(q) => {
                if q.owner != identity.user {
                    return Err(ServerError::Unauthorized(format!(
                        "handle {id} is not owned by {}",
                        identity.user
                    )));
                }
                Ok(q)
            }
            HandleEntry::Prepared(_) => Err(ServerError::UnknownHandle(format!(
                "handle {id} is a prepared statement, not a query"
            ))),
        }
    }

    /// Looks up or creates the running-query handle for `id` and marks one
    /// stream active on it. Tickets are stateless, so a fetch arriving after
    /// the entry was disposed re-registers it.
    pub fn begin_stream(&self, id: Uuid, identity: &Identity) -> Result<Arc<RunningQueryHandle>> {
        let query = self.query_entry(id, identity)?;
        if query.is_cancelled() {
            return Err(ServerError::Cancelled);
        }
        query.active_streams.fetch_add(1, Ordering::SeqCst);
        Ok(query)
    }

    /// Marks one stream finished. Entries with no remaining streams are
    /// disposed unless cancelled: cancelled entries stay as tombstones so
    /// later fetches observe the cancellation.
    pub fn finish_stream(&self, handle: &RunningQueryHandle) {
        let remaining = handle.active_streams.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 && !handle.is_cancelled() {
            self.remove(handle.id);
        }
    }

    /// Cancels the running query `id`. Idempotent: a second cancel is a
    /// no-op. Cancelling before any stream started leaves a cancelled
    /// tombstone behind, so the first fetch fails instead of executing.
    pub fn cancel(&self, id: Uuid, identity: &Identity) -> Result<()> {
        let query = self.query_entry(id, identity)?;
        query.cancel();
        Ok(())
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.read().expect("registry lock poisoned").len()
    }
}
