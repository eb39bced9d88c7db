//! Export table — stable integer identities for objects visible to
//! the peer.
//!
//! Every object the peer may address gets a 32-bit OID from a monotone
//! counter. Entries are reference counted: an `Unexport` (or a dropped
//! recording scope) decrements, and the entry disappears when the count
//! reaches zero. OIDs are never reused while the channel is open.
//! OID 1 is the channel itself, pinned for the channel's lifetime.

use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::TetherError;
use crate::pipe::PipeSink;
use crate::proxy::RemoteObject;

/// The OID under which every channel exports itself.
pub const CHANNEL_OID: u32 = 1;

/// Pin increment: large enough that ordinary unexports can never drain
/// the count.
const PIN_COUNT: u32 = u32::MAX / 2;

/// How many exports between outbound `Gc` prods.
pub(crate) const GC_INTERVAL: u64 = 10_000;

/// What an export entry points at.
#[derive(Clone)]
pub enum Exported {
    /// An invocable object; targeted by `UserRequest`.
    Object(Arc<dyn RemoteObject>),
    /// A pipe sink; targeted by `Chunk`/`Flush`/`Eof`.
    Pipe(Arc<dyn PipeSink>),
}

impl std::fmt::Debug for Exported {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Exported::Object(_) => f.write_str("Exported::Object"),
            Exported::Pipe(_) => f.write_str("Exported::Pipe"),
        }
    }
}

struct Entry {
    target: Exported,
    /// Interface names remote proxies may dispatch through.
    interfaces: Arc<[String]>,
    ref_count: u32,
    auto_unexport: bool,
    /// Where the export happened, when origin recording is enabled.
    created_at: Option<String>,
}

struct TableState {
    entries: HashMap<u32, Entry>,
    next_oid: u32,
    total_exports: u64,
    /// Recording scopes currently open, keyed by scope id.
    recordings: HashMap<u64, Vec<u32>>,
    next_recording: u64,
    aborted: bool,
}

/// Shared, lock-protected OID table. Cloning shares the same table.
#[derive(Clone)]
pub struct ExportTable {
    inner: Arc<Mutex<TableState>>,
    record_origins: bool,
}

tokio::task_local! {
    /// Recording scope the current task's exports belong to.
    pub(crate) static ACTIVE_RECORDING: u64;
}

impl ExportTable {
    pub(crate) fn new(record_origins: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TableState {
                entries: HashMap::new(),
                next_oid: CHANNEL_OID,
                total_exports: 0,
                recordings: HashMap::new(),
                next_recording: 1,
                aborted: false,
            })),
            record_origins,
        }
    }

    /// Insert `target` with `ref_count = 1` and return its fresh OID.
    ///
    /// Returns the OID and whether a `Gc` prod is due (every
    /// [`GC_INTERVAL`]th export).
    pub(crate) fn export(
        &self,
        interfaces: Arc<[String]>,
        target: Exported,
        auto_unexport: bool,
    ) -> (u32, bool) {
        let created_at = self
            .record_origins
            .then(|| Backtrace::force_capture().to_string());

        let mut state = self.inner.lock().unwrap();
        let oid = state.next_oid;
        state.next_oid += 1;
        state.total_exports += 1;
        let gc_due = state.total_exports % GC_INTERVAL == 0;

        state.entries.insert(
            oid,
            Entry {
                target,
                interfaces,
                ref_count: 1,
                auto_unexport,
                created_at,
            },
        );

        if auto_unexport
            && let Ok(scope) = ACTIVE_RECORDING.try_with(|id| *id)
            && let Some(recorded) = state.recordings.get_mut(&scope)
        {
            recorded.push(oid);
        }

        (oid, gc_due)
    }

    /// Look up an entry, failing with `NoSuchObject` when absent.
    pub fn get(&self, oid: u32) -> Result<Exported, TetherError> {
        let state = self.inner.lock().unwrap();
        state
            .entries
            .get(&oid)
            .map(|e| e.target.clone())
            .ok_or(TetherError::NoSuchObject(oid))
    }

    /// Look up an invocable object plus its declared interfaces.
    pub(crate) fn get_object(
        &self,
        oid: u32,
    ) -> Result<(Arc<dyn RemoteObject>, Arc<[String]>), TetherError> {
        let state = self.inner.lock().unwrap();
        let entry = state.entries.get(&oid).ok_or(TetherError::NoSuchObject(oid))?;
        match &entry.target {
            Exported::Object(obj) => Ok((obj.clone(), entry.interfaces.clone())),
            Exported::Pipe(_) => Err(TetherError::ProtocolViolation(
                "oid names a pipe sink, not an invocable object",
            )),
        }
    }

    /// Look up a pipe sink.
    pub(crate) fn get_pipe(&self, oid: u32) -> Result<Arc<dyn PipeSink>, TetherError> {
        match self.get(oid)? {
            Exported::Pipe(sink) => Ok(sink),
            Exported::Object(_) => Err(TetherError::ProtocolViolation(
                "oid names an invocable object, not a pipe sink",
            )),
        }
    }

    /// Effectively disable reclamation of `oid`.
    pub fn pin(&self, oid: u32) {
        let mut state = self.inner.lock().unwrap();
        if let Some(entry) = state.entries.get_mut(&oid) {
            entry.ref_count = entry.ref_count.saturating_add(PIN_COUNT);
        }
    }

    /// Drop one reference; remove the entry when the count reaches
    /// zero. `cause` names who asked, for the log line.
    ///
    /// A missing OID is an error when `severe_if_missing` is set (the
    /// caller had reason to believe the entry exists) and merely logged
    /// otherwise — after `abort` the table is empty by design and late
    /// unexports are expected.
    pub fn unexport_by_oid(
        &self,
        oid: u32,
        cause: Option<&str>,
        severe_if_missing: bool,
    ) -> Result<(), TetherError> {
        let cause = cause.unwrap_or("unexport");
        let mut state = self.inner.lock().unwrap();
        let aborted = state.aborted;
        match state.entries.get_mut(&oid) {
            Some(entry) => {
                entry.ref_count -= 1;
                if entry.ref_count == 0 {
                    state.entries.remove(&oid);
                }
                Ok(())
            }
            None if severe_if_missing && !aborted => {
                log::error!("{cause}: unknown oid {oid}");
                Err(TetherError::NoSuchObject(oid))
            }
            None => {
                log::debug!("{cause}: oid {oid} already released");
                Ok(())
            }
        }
    }

    /// Open a recording scope: exports with `auto_unexport` made by
    /// tasks running under [`with_recording`] are released when the
    /// returned handle drops.
    pub fn start_recording(&self) -> ExportRecording {
        let mut state = self.inner.lock().unwrap();
        let id = state.next_recording;
        state.next_recording += 1;
        state.recordings.insert(id, Vec::new());
        ExportRecording {
            table: self.clone(),
            id,
        }
    }

    /// Drop every entry. Called during channel termination so cyclic
    /// references through the table cannot outlive the channel.
    pub(crate) fn abort(&self, cause: Option<&TetherError>) {
        let mut state = self.inner.lock().unwrap();
        state.aborted = true;
        let dropped = state.entries.len();
        state.entries.clear();
        state.recordings.clear();
        match cause {
            Some(cause) => log::debug!("export table dropped ({dropped} entries): {cause}"),
            None => log::debug!("export table dropped ({dropped} entries)"),
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The recorded creation site of `oid`, when origin recording is
    /// enabled.
    pub fn created_at(&self, oid: u32) -> Option<String> {
        let state = self.inner.lock().unwrap();
        state.entries.get(&oid).and_then(|e| e.created_at.clone())
    }
}

/// Run `fut` with its exports attributed to the recording scope.
pub(crate) async fn with_recording<F>(recording: &ExportRecording, fut: F) -> F::Output
where
    F: Future,
{
    ACTIVE_RECORDING.scope(recording.id, fut).await
}

/// Handle to an open recording scope. Dropping it unexports every
/// auto-unexport entry recorded in the scope.
pub struct ExportRecording {
    table: ExportTable,
    id: u64,
}

impl Drop for ExportRecording {
    fn drop(&mut self) {
        let recorded = {
            let mut state = self.table.inner.lock().unwrap();
            state.recordings.remove(&self.id).unwrap_or_default()
        };
        for oid in recorded {
            if let Err(e) = self.table.unexport_by_oid(oid, Some("request scope closed"), false) {
                log::warn!("scope unexport of oid {oid} failed: {e}");
            }
        }
    }
}
