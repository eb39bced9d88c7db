//! Channel core — one endpoint of one bidirectional remoting session.
//!
//! A `Channel` owns the transport, the export table, the request
//! dispatcher, the pipe machinery, a property map, listeners, and
//! counters. Construction performs the capability handshake, exports
//! the channel itself as OID 1, and spawns the read loop plus the
//! single-lane pipe worker.
//!
//! Teardown has two paths that converge on one terminal state:
//! [`close`] (orderly, sends the final `Close` command) and
//! [`terminate`] (abrupt). Either way every pending call fails with
//! the termination cause, all waiters unblock, and listeners are
//! notified exactly once.
//!
//! [`close`]: Channel::close
//! [`terminate`]: Channel::terminate

pub mod phase;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Notify;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::capability::Capabilities;
use crate::codec::{
    DEFAULT_MAX_COMMAND, DEFAULT_RECORDER_CAPACITY, FrameDecoder, FrameEncoder,
};
use crate::command::Command;
use crate::dispatch::{CallOutcome, Dispatcher, PendingCall};
use crate::error::TetherError;
use crate::export::{CHANNEL_OID, ExportTable, Exported, with_recording};
use crate::handshake::{self, Mode};
use crate::marshal::{self, BincodeWire, WireFormat};
use crate::pipe::queue::{PipeJob, PipeQueue, spawn_pipe_worker};
use crate::pipe::window::DEFAULT_WINDOW_MAX;
use crate::pipe::{PipeReader, PipeRegistry, PipeSink, PipeWindow, RemotePipeWriter, reader_sink};
use crate::proxy::{CallPayload, RemoteHandle, RemoteObject, RemoteRef, Resolved, selector_allowed};
use crate::transport::{BoxedReader, BoxedWriter, CommandWriter, spawn_read_loop};

pub use phase::ChannelPhase;

/// Interface name of the channel's own OID-1 export.
pub const CHANNEL_INTERFACE: &str = "tether.Channel";

const SEL_PROPERTY_GET: &str = "tether.Channel.property.get";
const SEL_PROPERTY_SET: &str = "tether.Channel.property.set";
const SEL_PROPERTY_WAIT: &str = "tether.Channel.property.wait";

/// Watchdog period for [`Channel::join`].
const JOIN_WATCHDOG: Duration = Duration::from_secs(30);

/// Default depth of the reader queue behind [`Channel::new_pipe`].
const DEFAULT_PIPE_DEPTH: usize = 8;

// ── Listeners ────────────────────────────────────────────────────

/// Callbacks observing channel activity.
///
/// Implementations must not panic; a panic is caught, logged, and the
/// listener is otherwise ignored for that event.
pub trait ChannelListener: Send + Sync {
    /// The channel reached its terminal state. `cause` is `None` for
    /// an orderly shutdown.
    fn on_closed(&self, channel: &Channel, cause: Option<&TetherError>) {
        let _ = (channel, cause);
    }

    /// A command was received (`size` is its serialized length).
    fn on_read(&self, channel: &Channel, command: &Command, size: usize) {
        let _ = (channel, command, size);
    }

    /// A command was written (`size` is its serialized length).
    fn on_write(&self, channel: &Channel, command: &Command, size: usize) {
        let _ = (channel, command, size);
    }
}

// ── Counters ─────────────────────────────────────────────────────

struct Counters {
    created: Instant,
    commands_sent: AtomicU64,
    commands_received: AtomicU64,
    last_sent_ms: AtomicU64,
    last_heard_ms: AtomicU64,
    content_loads: AtomicU64,
    content_load_nanos: AtomicU64,
}

impl Counters {
    fn new() -> Self {
        Self {
            created: Instant::now(),
            commands_sent: AtomicU64::new(0),
            commands_received: AtomicU64::new(0),
            last_sent_ms: AtomicU64::new(0),
            last_heard_ms: AtomicU64::new(0),
            content_loads: AtomicU64::new(0),
            content_load_nanos: AtomicU64::new(0),
        }
    }

    fn stamp(&self) -> u64 {
        self.created.elapsed().as_millis() as u64
    }

    fn at(&self, ms: u64) -> Instant {
        self.created + Duration::from_millis(ms)
    }
}

/// A cheap snapshot of channel state for host diagnostics.
#[derive(Debug, Clone)]
pub struct ChannelDiagnostics {
    pub name: String,
    pub phase: ChannelPhase,
    pub commands_sent: u64,
    pub commands_received: u64,
    pub last_sent_at: Instant,
    pub last_heard_at: Instant,
    pub export_count: usize,
    pub pending_calls: usize,
    pub executing_calls: usize,
    pub content_loads: u64,
    pub content_load_time: Duration,
}

// ── Properties ───────────────────────────────────────────────────

struct PropertyMap {
    state: Mutex<PropertyState>,
    notify: Notify,
}

struct PropertyState {
    map: HashMap<String, Bytes>,
    closed: bool,
}

impl PropertyMap {
    fn new() -> Self {
        Self {
            state: Mutex::new(PropertyState {
                map: HashMap::new(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    fn set(&self, key: String, value: Bytes) {
        self.state.lock().unwrap().map.insert(key, value);
        self.notify.notify_waiters();
    }

    fn get(&self, key: &str) -> Option<Bytes> {
        self.state.lock().unwrap().map.get(key).cloned()
    }

    /// `None` means the channel closed before the key appeared.
    async fn wait(&self, key: &str) -> Option<Bytes> {
        loop {
            let notified = self.notify.notified();
            {
                let state = self.state.lock().unwrap();
                if let Some(value) = state.map.get(key) {
                    return Some(value.clone());
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.notify.notify_waiters();
    }
}

// ── Builder ──────────────────────────────────────────────────────

/// Configures and constructs a [`Channel`] over a byte stream.
pub struct ChannelBuilder {
    name: String,
    capabilities: Capabilities,
    mode: Mode,
    window_max: usize,
    recorder_capacity: usize,
    max_command: usize,
    record_export_origins: bool,
    wire: Arc<dyn WireFormat>,
}

impl ChannelBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capabilities: Capabilities::current(),
            mode: Mode::Binary,
            window_max: DEFAULT_WINDOW_MAX,
            recorder_capacity: DEFAULT_RECORDER_CAPACITY,
            max_command: DEFAULT_MAX_COMMAND,
            record_export_origins: false,
            wire: Arc::new(BincodeWire),
        }
    }

    /// Restrict the advertised capability set.
    pub fn capabilities(mut self, caps: Capabilities) -> Self {
        self.capabilities = caps;
        self
    }

    /// How this side opens mode negotiation.
    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Per-pipe in-flight byte budget.
    pub fn window_max(mut self, bytes: usize) -> Self {
        self.window_max = bytes.max(1);
        self
    }

    /// Flight-recorder retention for corruption diagnostics.
    pub fn recorder_capacity(mut self, bytes: usize) -> Self {
        self.recorder_capacity = bytes;
        self
    }

    /// Cap on one logical command payload.
    pub fn max_command(mut self, bytes: usize) -> Self {
        self.max_command = bytes;
        self
    }

    /// Capture a backtrace at every export (costly; for leak hunts).
    pub fn record_export_origins(mut self, enabled: bool) -> Self {
        self.record_export_origins = enabled;
        self
    }

    /// Replace the command serializer.
    pub fn wire(mut self, wire: Arc<dyn WireFormat>) -> Self {
        self.wire = wire;
        self
    }

    /// Perform the handshake over `stream` and bring the channel up.
    pub async fn build<S>(self, stream: S) -> Result<Channel, TetherError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let token = fresh_token();
        let (reader, writer) = tokio::io::split(stream);
        let mut reader: BoxedReader = Box::new(reader);
        let mut writer: BoxedWriter = Box::new(writer);

        let outcome =
            handshake::exchange(&mut reader, &mut writer, self.capabilities, token, self.mode)
                .await?;
        let effective = self.capabilities.negotiate(outcome.remote_caps);

        let encoder = FrameEncoder::new(outcome.framing, self.max_command);
        let decoder = FrameDecoder::new(outcome.framing, self.max_command, self.recorder_capacity);
        let mut framed_read = FramedRead::new(reader, decoder);
        if !outcome.leftover.is_empty() {
            framed_read
                .read_buffer_mut()
                .extend_from_slice(&outcome.leftover);
        }
        let framed_write = FramedWrite::new(writer, encoder);

        let (pipe_queue, pipe_backend) = PipeQueue::new();
        let channel_interfaces: Arc<[String]> = Arc::from(vec![CHANNEL_INTERFACE.to_string()]);

        let channel = Channel {
            inner: Arc::new(ChannelInner {
                name: self.name,
                token,
                remote_token: outcome.remote_token,
                local_caps: self.capabilities,
                remote_caps: outcome.remote_caps,
                effective_caps: effective,
                window_max: self.window_max,
                wire: self.wire,
                writer: tokio::sync::Mutex::new(Some(framed_write)),
                phase: Mutex::new(ChannelPhase::Alive),
                close_cause: Mutex::new(None),
                terminated: CancellationToken::new(),
                exports: ExportTable::new(self.record_export_origins),
                dispatch: Dispatcher::new(),
                pipes: PipeRegistry::new(),
                pipe_queue,
                properties: PropertyMap::new(),
                listeners: Mutex::new(Vec::new()),
                counters: Counters::new(),
                channel_interfaces,
            }),
        };

        // The channel itself is OID 1, pinned for the channel's life.
        let (oid, _) = channel.inner.exports.export(
            channel.inner.channel_interfaces.clone(),
            Exported::Object(Arc::new(ChannelApi)),
            false,
        );
        debug_assert_eq!(oid, CHANNEL_OID);
        channel.inner.exports.pin(oid);

        let _ = spawn_pipe_worker(channel.clone(), pipe_backend);
        let _ = spawn_read_loop(channel.clone(), framed_read);

        log::debug!(
            "[{}] channel up: caps {}, remote caps {}",
            channel.name(),
            channel.inner.local_caps.token(),
            channel.inner.remote_caps.token()
        );
        Ok(channel)
    }
}

fn fresh_token() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u64(std::process::id() as u64);
    hasher.finish()
}

// ── Channel ──────────────────────────────────────────────────────

struct ChannelInner {
    name: String,
    token: u64,
    remote_token: u64,
    local_caps: Capabilities,
    remote_caps: Capabilities,
    effective_caps: Capabilities,
    window_max: usize,
    wire: Arc<dyn WireFormat>,
    /// Outbound lane. `None` once the write half is closed; the lock
    /// also serializes every write.
    writer: tokio::sync::Mutex<Option<CommandWriter>>,
    phase: Mutex<ChannelPhase>,
    close_cause: Mutex<Option<Arc<TetherError>>>,
    terminated: CancellationToken,
    exports: ExportTable,
    dispatch: Dispatcher,
    pipes: PipeRegistry,
    pipe_queue: PipeQueue,
    properties: PropertyMap,
    listeners: Mutex<Vec<Arc<dyn ChannelListener>>>,
    counters: Counters,
    channel_interfaces: Arc<[String]>,
}

/// One endpoint of one remoting session. Cheap to clone; all clones
/// share the same state.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    // ── Identity & capabilities ──────────────────────────────────

    /// The channel's name, for logs and diagnostics.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// This side's identity token, carried by refs to local exports.
    pub fn token(&self) -> u64 {
        self.inner.token
    }

    /// Capabilities advertised by this side.
    pub fn local_capabilities(&self) -> Capabilities {
        self.inner.local_caps
    }

    /// Capabilities advertised by the peer.
    pub fn remote_capabilities(&self) -> Capabilities {
        self.inner.remote_caps
    }

    /// Effective capabilities: the intersection of both sides.
    pub fn capabilities(&self) -> Capabilities {
        self.inner.effective_caps
    }

    /// Whether pipe flow control is active on this channel.
    pub fn pipe_throttling(&self) -> bool {
        self.inner
            .effective_caps
            .contains(Capabilities::PIPE_THROTTLING)
    }

    // ── Exports & proxies ────────────────────────────────────────

    /// The export table backing this channel.
    pub fn exports(&self) -> &ExportTable {
        &self.inner.exports
    }

    /// Expose `object` to the peer; the returned ref can travel in
    /// any payload. Auto-unexport entries are released when the
    /// request scope that exported them completes.
    pub fn export_object(&self, object: Arc<dyn RemoteObject>, auto_unexport: bool) -> RemoteRef {
        let interfaces: Vec<String> = object
            .interfaces()
            .iter()
            .map(|s| s.to_string())
            .collect();
        let (oid, gc_due) = self.inner.exports.export(
            Arc::from(interfaces.clone()),
            Exported::Object(object),
            auto_unexport,
        );
        self.maybe_send_gc(gc_due);
        RemoteRef {
            token: self.token(),
            oid,
            interfaces,
        }
    }

    /// Resolve a ref: the original object when it came home, a
    /// dispatching proxy otherwise.
    pub fn resolve_ref(&self, r: &RemoteRef) -> Result<Resolved, TetherError> {
        if r.token == self.token() {
            let (object, _) = self.inner.exports.get_object(r.oid)?;
            Ok(Resolved::Local(object))
        } else {
            Ok(Resolved::Proxy(RemoteHandle::new(
                self.clone(),
                r.token,
                r.oid,
                Arc::from(r.interfaces.clone()),
            )))
        }
    }

    /// Handle on the peer's own OID-1 export.
    pub fn remote_root(&self) -> RemoteHandle {
        RemoteHandle::new(
            self.clone(),
            self.inner.remote_token,
            CHANNEL_OID,
            self.inner.channel_interfaces.clone(),
        )
    }

    fn maybe_send_gc(&self, due: bool) {
        if !due {
            return;
        }
        let channel = self.clone();
        tokio::spawn(async move {
            if let Err(e) = channel.send(&Command::Gc, false).await {
                log::debug!("[{}] gc prod not sent: {e}", channel.name());
            }
        });
    }

    // ── Pipes ────────────────────────────────────────────────────

    /// Export a custom sink; the returned OID addresses it in
    /// `Chunk`/`Flush`/`Eof` commands from the peer.
    pub fn export_pipe(&self, sink: Arc<dyn PipeSink>) -> u32 {
        let (oid, gc_due) =
            self.inner
                .exports
                .export(Arc::from(Vec::<String>::new()), Exported::Pipe(sink), false);
        self.maybe_send_gc(gc_due);
        oid
    }

    /// Export a queue-backed sink and keep the consumer half locally.
    pub fn new_pipe(&self) -> (u32, PipeReader) {
        let (sink, reader) = reader_sink(DEFAULT_PIPE_DEPTH);
        (self.export_pipe(Arc::new(sink)), reader)
    }

    /// Writer for a sink the peer exported as `oid`.
    pub fn open_pipe(&self, oid: u32) -> RemotePipeWriter {
        let window = if self.pipe_throttling() {
            PipeWindow::bounded(self.inner.window_max)
        } else {
            PipeWindow::unthrottled(self.inner.window_max)
        };
        let window = Arc::new(window);
        self.inner.pipes.register(oid, &window);
        RemotePipeWriter::new(self.clone(), oid, window)
    }

    // ── Properties ───────────────────────────────────────────────

    /// Set a local property, waking `wait_for_property` callers.
    pub fn set_property(&self, key: impl Into<String>, value: Bytes) {
        self.inner.properties.set(key.into(), value);
    }

    /// Read a local property.
    pub fn property(&self, key: &str) -> Option<Bytes> {
        self.inner.properties.get(key)
    }

    /// Block until the local property appears or the channel closes.
    pub async fn wait_for_property(&self, key: &str) -> Result<Bytes, TetherError> {
        match self.inner.properties.wait(key).await {
            Some(value) => Ok(value),
            None => Err(TetherError::closed(self.close_cause())),
        }
    }

    /// Read a property of the peer channel.
    pub async fn get_remote_property(&self, key: &str) -> Result<Option<Bytes>, TetherError> {
        self.remote_root()
            .call_typed(SEL_PROPERTY_GET, &key.to_string())
            .await
    }

    /// Set a property on the peer channel.
    pub async fn set_remote_property(&self, key: &str, value: Bytes) -> Result<(), TetherError> {
        self.remote_root()
            .call_typed(SEL_PROPERTY_SET, &(key.to_string(), value))
            .await
    }

    /// Block until a property of the peer channel appears.
    pub async fn wait_for_remote_property(&self, key: &str) -> Result<Bytes, TetherError> {
        self.remote_root()
            .call_typed(SEL_PROPERTY_WAIT, &key.to_string())
            .await
    }

    // ── Listeners, counters, diagnostics ─────────────────────────

    /// Register a listener. Held until the channel terminates.
    pub fn add_listener(&self, listener: Arc<dyn ChannelListener>) {
        self.inner.listeners.lock().unwrap().push(listener);
    }

    /// Monotone count of commands written.
    pub fn commands_sent(&self) -> u64 {
        self.inner.counters.commands_sent.load(Ordering::Relaxed)
    }

    /// Monotone count of commands received.
    pub fn commands_received(&self) -> u64 {
        self.inner.counters.commands_received.load(Ordering::Relaxed)
    }

    /// When the last command was written (channel creation if none).
    pub fn last_sent_at(&self) -> Instant {
        self.inner
            .counters
            .at(self.inner.counters.last_sent_ms.load(Ordering::Relaxed))
    }

    /// When the last command was received (channel creation if none).
    pub fn last_heard_at(&self) -> Instant {
        self.inner
            .counters
            .at(self.inner.counters.last_heard_ms.load(Ordering::Relaxed))
    }

    /// Account one content-store load for diagnostics.
    pub fn record_content_load(&self, elapsed: Duration) {
        self.inner.counters.content_loads.fetch_add(1, Ordering::Relaxed);
        self.inner
            .counters
            .content_load_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Snapshot of counters and table sizes.
    pub fn diagnostics(&self) -> ChannelDiagnostics {
        ChannelDiagnostics {
            name: self.inner.name.clone(),
            phase: self.phase(),
            commands_sent: self.commands_sent(),
            commands_received: self.commands_received(),
            last_sent_at: self.last_sent_at(),
            last_heard_at: self.last_heard_at(),
            export_count: self.inner.exports.len(),
            pending_calls: self.inner.dispatch.pending_count(),
            executing_calls: self.inner.dispatch.executing_count(),
            content_loads: self.inner.counters.content_loads.load(Ordering::Relaxed),
            content_load_time: Duration::from_nanos(
                self.inner.counters.content_load_nanos.load(Ordering::Relaxed),
            ),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Current lifecycle phase.
    pub fn phase(&self) -> ChannelPhase {
        *self.inner.phase.lock().unwrap()
    }

    /// Whether the channel reached its terminal state.
    pub fn is_terminated(&self) -> bool {
        self.phase().is_terminated()
    }

    /// The cause the channel went (or is going) down with.
    pub fn close_cause(&self) -> Option<Arc<TetherError>> {
        self.inner.close_cause.lock().unwrap().clone()
    }

    /// Orderly shutdown: send the final `Close` command and stop
    /// writing. Full teardown completes when the reciprocal `Close`
    /// arrives (or the transport drops). Idempotent.
    pub async fn close(&self) -> Result<(), TetherError> {
        self.close_with(None).await
    }

    /// Orderly shutdown with a diagnostic for the peer.
    pub async fn close_with(&self, cause: Option<String>) -> Result<(), TetherError> {
        let initiated = self.inner.phase.lock().unwrap().request_close();
        if !initiated {
            return Ok(());
        }
        log::debug!("[{}] closing channel", self.name());
        match self.send(&Command::Close { cause }, true).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // Close could not reach the peer; there is nothing
                // orderly left to do.
                let cause = Arc::new(e);
                self.terminate_with(cause.clone()).await;
                Err(TetherError::closed(Some(cause)))
            }
        }
    }

    /// Abrupt teardown with a cause. Idempotent; converges with
    /// [`close`](Channel::close) on the same terminal state.
    pub async fn terminate(&self, cause: TetherError) {
        self.terminate_with(Arc::new(cause)).await;
    }

    pub(crate) async fn terminate_with(&self, cause: Arc<TetherError>) {
        let transitioned = {
            let mut phase = self.inner.phase.lock().unwrap();
            if phase.terminate() {
                *self.inner.close_cause.lock().unwrap() = Some(cause.clone());
                true
            } else {
                false
            }
        };
        if !transitioned {
            return;
        }

        if cause.is_orderly() {
            log::debug!("[{}] terminated (orderly)", self.name());
        } else {
            log::warn!("[{}] terminated: {cause}", self.name());
        }

        // Wake the read loop, pipe worker, join and sync waiters.
        self.inner.terminated.cancel();

        // Drop the write half: nothing goes out ever again.
        {
            let mut writer = self.inner.writer.lock().await;
            *writer = None;
        }

        self.inner.dispatch.abort_all(cause.clone());
        self.inner.pipes.abort_all(cause.clone());
        self.inner.exports.abort(Some(cause.as_ref()));
        self.inner.properties.close();

        let reported = if cause.is_orderly() {
            None
        } else {
            Some(cause.as_ref())
        };
        let listeners: Vec<_> = self.inner.listeners.lock().unwrap().clone();
        for listener in listeners {
            let guarded = std::panic::catch_unwind(AssertUnwindSafe(|| {
                listener.on_closed(self, reported)
            }));
            if guarded.is_err() {
                log::warn!("[{}] close listener panicked", self.name());
            }
        }
    }

    /// Wait until the channel terminates, waking at least every 30 s
    /// as a watchdog.
    pub async fn join(&self) {
        let token = self.inner.terminated.clone();
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(JOIN_WATCHDOG) => {
                    log::trace!("[{}] join watchdog: channel still open", self.name());
                }
            }
        }
    }

    /// [`join`](Channel::join) with a deadline.
    pub async fn join_timeout(&self, limit: Duration) -> Result<(), TetherError> {
        tokio::time::timeout(limit, self.join())
            .await
            .map_err(|_| TetherError::Timeout(limit))
    }

    // ── Outbound path ────────────────────────────────────────────

    /// Serialize and write one command. `is_close` marks the final
    /// command: after it is on the wire the write half is dropped.
    pub(crate) async fn send(&self, cmd: &Command, is_close: bool) -> Result<(), TetherError> {
        {
            let phase = self.inner.phase.lock().unwrap();
            let allowed = if is_close {
                !phase.is_terminated()
            } else {
                phase.outbound_open()
            };
            if !allowed {
                return Err(TetherError::closed(self.close_cause()));
            }
        }

        let payload = marshal::with_channel(self, || self.inner.wire.encode(cmd))?;
        let size = payload.len();

        let mut guard = self.inner.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(TetherError::closed(self.close_cause()));
        };
        // A write stuck on a full transport must not outlive
        // termination: the token is cancelled before teardown takes
        // this lock.
        let token = self.inner.terminated.clone();
        tokio::select! {
            biased;
            result = writer.send(payload) => result?,
            _ = token.cancelled() => {
                return Err(TetherError::closed(self.close_cause()));
            }
        }
        self.inner
            .counters
            .commands_sent
            .fetch_add(1, Ordering::Relaxed);
        self.inner
            .counters
            .last_sent_ms
            .store(self.inner.counters.stamp(), Ordering::Relaxed);
        if is_close {
            *guard = None;
        }
        drop(guard);

        log::trace!("[{}] sent {} ({size} bytes)", self.name(), cmd.name());
        self.notify_write(cmd, size);
        Ok(())
    }

    /// Issue a request and wait for the peer's answer.
    pub(crate) async fn issue_request(
        &self,
        selector: &str,
        payload: Bytes,
    ) -> Result<Bytes, TetherError> {
        self.issue_request_deferred(selector, payload)
            .await?
            .response()
            .await
    }

    /// Issue a request; the call is on the wire when this returns.
    pub(crate) async fn issue_request_deferred(
        &self,
        selector: &str,
        payload: Bytes,
    ) -> Result<PendingCall, TetherError> {
        let id = self.inner.dispatch.allocate_request_id();
        let rx = self.inner.dispatch.register(id);
        match self.send(&Command::UserRequest { id, payload }, false).await {
            Ok(()) => Ok(PendingCall::new(self.clone(), id, selector.to_string(), rx)),
            Err(e) => {
                self.inner.dispatch.unregister(id);
                Err(e)
            }
        }
    }

    // ── Inbound command handling ─────────────────────────────────

    pub(crate) fn accept_user_request(&self, id: u64, payload: Bytes) -> Result<(), TetherError> {
        let watermark = self.inner.pipe_queue.watermark();
        let token = self.inner.dispatch.begin_execute(id);
        let channel = self.clone();
        tokio::spawn(async move {
            let recording = channel.inner.exports.start_recording();
            let work = with_recording(
                &recording,
                marshal::with_channel_async(channel.clone(), async {
                    channel.run_user_request(payload).await
                }),
            );
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                result = work => Some(result),
            };
            drop(recording);
            channel.inner.dispatch.finish_execute(id);

            let Some(result) = result else {
                log::trace!("[{}] request {id} cancelled", channel.name());
                return;
            };

            // Pipe I/O that arrived before this request must land
            // before its response is visible.
            channel.inner.pipe_queue.sync(watermark).await;

            let response = match result {
                Ok(body) => Command::Response { id, ok: true, body },
                Err(e) => Command::Response {
                    id,
                    ok: false,
                    body: Bytes::from(e.to_string().into_bytes()),
                },
            };
            // Best-effort: the channel may have closed underneath us.
            if let Err(e) = channel.send(&response, false).await {
                log::debug!("[{}] response for request {id} not sent: {e}", channel.name());
            }
        });
        Ok(())
    }

    async fn run_user_request(&self, payload: Bytes) -> Result<Bytes, TetherError> {
        let call: CallPayload = marshal::decode_value(&payload)?;
        let (object, interfaces) = self.inner.exports.get_object(call.oid)?;
        if !selector_allowed(&interfaces, &call.selector) {
            return Err(TetherError::BadSelector {
                selector: call.selector,
            });
        }
        object.invoke(self, &call.selector, call.args).await
    }

    pub(crate) fn accept_response(&self, id: u64, ok: bool, body: Bytes) -> Result<(), TetherError> {
        let watermark = self.inner.pipe_queue.watermark();
        let outcome = if ok {
            CallOutcome::Success(body)
        } else {
            CallOutcome::RemoteError(String::from_utf8_lossy(&body).into_owned())
        };
        let channel = self.clone();
        tokio::spawn(async move {
            // Hold the completion until pipe writes that arrived
            // before this response have executed.
            channel.inner.pipe_queue.sync(watermark).await;
            if !channel.inner.dispatch.complete(id, outcome) {
                log::debug!("[{}] response for unknown request {id} dropped", channel.name());
            }
        });
        Ok(())
    }

    pub(crate) async fn accept_close(&self, cause: Option<String>) -> Result<(), TetherError> {
        match &cause {
            Some(cause) => log::debug!("[{}] peer closed the channel: {cause}", self.name()),
            None => log::debug!("[{}] peer closed the channel", self.name()),
        }
        // Pipe I/O that arrived before the Close lands before teardown
        // (the peer flushed its stream before sending Close).
        let watermark = self.inner.pipe_queue.watermark();
        self.inner.pipe_queue.sync(watermark).await;
        // Reciprocate if we had not closed ourselves; no-op otherwise.
        if let Err(e) = self.close().await {
            log::debug!("[{}] reciprocal close failed: {e}", self.name());
        }
        self.terminate_with(Arc::new(TetherError::OrderlyShutdown))
            .await;
        Ok(())
    }

    pub(crate) fn accept_ack(&self, oid: u32, size: u64) -> Result<(), TetherError> {
        self.inner.pipes.increase(oid, size as usize);
        Ok(())
    }

    pub(crate) fn accept_notify_dead(&self, oid: u32, cause: String) -> Result<(), TetherError> {
        self.inner
            .pipes
            .dead(oid, Arc::new(TetherError::PipeBroken(cause)));
        Ok(())
    }

    pub(crate) fn submit_pipe_job(&self, job: PipeJob, wire_io_id: u64) -> Result<(), TetherError> {
        log::trace!("[{}] pipe job (io {wire_io_id}) queued", self.name());
        if self.inner.pipe_queue.submit(job).is_err() {
            // The worker is gone only while terminating; the job is moot.
            log::debug!("[{}] pipe lane closed; job dropped", self.name());
        }
        Ok(())
    }

    // ── Plumbing shared with submodules ──────────────────────────

    pub(crate) fn wire(&self) -> &dyn WireFormat {
        self.inner.wire.as_ref()
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatch
    }

    pub(crate) fn next_io_id(&self) -> u64 {
        self.inner.dispatch.next_io_id()
    }

    /// Resolves when the channel terminates.
    pub(crate) fn terminated(&self) -> WaitForCancellationFutureOwned {
        self.inner.terminated.clone().cancelled_owned()
    }

    pub(crate) fn note_received(&self) {
        self.inner
            .counters
            .commands_received
            .fetch_add(1, Ordering::Relaxed);
        self.inner
            .counters
            .last_heard_ms
            .store(self.inner.counters.stamp(), Ordering::Relaxed);
    }

    pub(crate) fn notify_read(&self, cmd: &Command, size: usize) {
        let listeners: Vec<_> = self.inner.listeners.lock().unwrap().clone();
        for listener in listeners {
            let guarded =
                std::panic::catch_unwind(AssertUnwindSafe(|| listener.on_read(self, cmd, size)));
            if guarded.is_err() {
                log::warn!("[{}] read listener panicked", self.name());
            }
        }
    }

    fn notify_write(&self, cmd: &Command, size: usize) {
        let listeners: Vec<_> = self.inner.listeners.lock().unwrap().clone();
        for listener in listeners {
            let guarded =
                std::panic::catch_unwind(AssertUnwindSafe(|| listener.on_write(self, cmd, size)));
            if guarded.is_err() {
                log::warn!("[{}] write listener panicked", self.name());
            }
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.inner.name)
            .field("phase", &self.phase())
            .field("capabilities", &self.inner.effective_caps)
            .finish()
    }
}

// ── The channel's own remote surface (OID 1) ─────────────────────

/// Selector dispatch for the channel's OID-1 export: remote property
/// access.
struct ChannelApi;

#[async_trait::async_trait]
impl RemoteObject for ChannelApi {
    fn interfaces(&self) -> &'static [&'static str] {
        &[CHANNEL_INTERFACE]
    }

    async fn invoke(
        &self,
        channel: &Channel,
        selector: &str,
        args: Bytes,
    ) -> Result<Bytes, TetherError> {
        match selector {
            SEL_PROPERTY_GET => {
                let key: String = marshal::decode_value(&args)?;
                marshal::encode_value(&channel.property(&key))
            }
            SEL_PROPERTY_SET => {
                let (key, value): (String, Bytes) = marshal::decode_value(&args)?;
                channel.set_property(key, value);
                marshal::encode_value(&())
            }
            SEL_PROPERTY_WAIT => {
                let key: String = marshal::decode_value(&args)?;
                let value = channel.wait_for_property(&key).await?;
                marshal::encode_value(&value)
            }
            other => Err(TetherError::BadSelector {
                selector: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Two fully handshaken channels over an in-memory duplex stream.
    pub(crate) async fn duplex_pair() -> (Channel, Channel) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let left = ChannelBuilder::new("left").build(a);
        let right = ChannelBuilder::new("right").build(b);
        tokio::try_join!(left, right).expect("channel pair")
    }

    #[tokio::test]
    async fn tokens_are_distinct_and_exchanged() {
        let (a, b) = duplex_pair().await;
        assert_ne!(a.token(), b.token());
        // Each side learned the other's identity during the handshake.
        assert_eq!(a.remote_root().to_ref().token, b.token());
        assert_eq!(b.remote_root().to_ref().token, a.token());
    }

    #[tokio::test]
    async fn effective_caps_are_intersection() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let left = ChannelBuilder::new("left").build(a);
        let right = ChannelBuilder::new("right")
            .capabilities(Capabilities::CHUNKED_ENCODING)
            .build(b);
        let (left, right) = tokio::try_join!(left, right).unwrap();

        assert_eq!(left.capabilities(), Capabilities::CHUNKED_ENCODING);
        assert_eq!(right.capabilities(), Capabilities::CHUNKED_ENCODING);
        assert!(!left.pipe_throttling());
        assert!(!right.pipe_throttling());
    }

    #[tokio::test]
    async fn local_properties_set_get_wait() {
        let (a, _b) = duplex_pair().await;

        assert!(a.property("k").is_none());
        a.set_property("k", Bytes::from_static(b"v"));
        assert_eq!(&a.property("k").unwrap()[..], b"v");

        // A waiter parked before the set is woken by it.
        let waiter = {
            let a = a.clone();
            tokio::spawn(async move { a.wait_for_property("later").await })
        };
        tokio::task::yield_now().await;
        a.set_property("later", Bytes::from_static(b"arrived"));
        assert_eq!(&waiter.await.unwrap().unwrap()[..], b"arrived");
    }

    #[tokio::test]
    async fn wait_for_property_fails_on_termination() {
        let (a, _b) = duplex_pair().await;
        let waiter = {
            let a = a.clone();
            tokio::spawn(async move { a.wait_for_property("never").await })
        };
        tokio::task::yield_now().await;
        a.terminate(TetherError::from("test teardown")).await;

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, TetherError::ChannelClosed { .. }));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (a, b) = duplex_pair().await;
        a.close().await.unwrap();
        a.close().await.unwrap();
        a.join_timeout(Duration::from_secs(5)).await.unwrap();
        b.join_timeout(Duration::from_secs(5)).await.unwrap();
        assert!(a.is_terminated());
        assert!(b.is_terminated());
    }

    #[tokio::test]
    async fn send_after_close_is_rejected() {
        let (a, b) = duplex_pair().await;
        a.close().await.unwrap();
        let err = a.send(&Command::Gc, false).await.unwrap_err();
        assert!(matches!(err, TetherError::ChannelClosed { .. }));
        drop(b);
    }

    #[tokio::test]
    async fn terminated_channel_reports_cause() {
        let (a, _b) = duplex_pair().await;
        a.terminate(TetherError::from("operator abort")).await;
        let cause = a.close_cause().unwrap();
        assert!(cause.to_string().contains("operator abort"));
        assert!(a.is_terminated());
        // Idempotent: a second terminate does not replace the cause.
        a.terminate(TetherError::from("second")).await;
        assert!(a.close_cause().unwrap().to_string().contains("operator"));
    }

    #[tokio::test]
    async fn diagnostics_snapshot() {
        let (a, _b) = duplex_pair().await;
        let diag = a.diagnostics();
        assert_eq!(diag.name, "left");
        assert_eq!(diag.phase, ChannelPhase::Alive);
        assert_eq!(diag.export_count, 1); // the channel itself
        assert_eq!(diag.pending_calls, 0);

        a.record_content_load(Duration::from_millis(5));
        let diag = a.diagnostics();
        assert_eq!(diag.content_loads, 1);
        assert!(diag.content_load_time >= Duration::from_millis(5));
    }
}
