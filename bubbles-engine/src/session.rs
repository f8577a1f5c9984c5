//! Session facade: one explicit engine instance with an explicit lifetime.
//!
//! A [`Session`] owns a small multi-threaded tokio runtime that hosts the
//! I/O loop and the optional autopilot. Its methods are synchronous and
//! bounded, so they can be called straight from a UI or FFI thread. They
//! must not be called from inside another async runtime. Dropping a session
//! there is allowed: its runtime is then shut down in the background.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::{Handle, Runtime};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::autopilot::{self, AutopilotPath};
use crate::compression::Compression;
use crate::config::EngineConfig;
use crate::connection::{self, IoCommand, Link, Target};
use crate::error::EngineError;
use crate::lifecycle::{Lifecycle, LifecycleState};
use crate::mapper::Frame;
use crate::plot::{PlotSnapshot, Plotter};
use crate::pointer::{LocalPointer, PointerSnapshot};
use crate::protocol::ProtocolError;
use crate::roster::{color_from_id, Participant, PositionRoster};
use crate::transport::{self, ClientTls, CredentialBundle};

/// Transport security for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityMode {
    #[default]
    Plain,
    MutualTls,
}

/// Everything needed to reach a room. Fixed once the session starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEndpoint {
    /// `host[:port]`
    pub address: String,
    pub room: String,
    pub security: SecurityMode,
    pub compressed: bool,
    pub autopilot: bool,
}

impl SessionEndpoint {
    pub fn new(address: impl Into<String>, room: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            room: room.into(),
            security: SecurityMode::Plain,
            compressed: false,
            autopilot: false,
        }
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.security = if secure {
            SecurityMode::MutualTls
        } else {
            SecurityMode::Plain
        };
        self
    }

    pub fn compressed(mut self, compressed: bool) -> Self {
        self.compressed = compressed;
        self
    }

    pub fn autopilot(mut self, autopilot: bool) -> Self {
        self.autopilot = autopilot;
        self
    }
}

/// Upward notifications for the embedder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The roster changed; the next frame should be drawn now.
    Redraw,
    /// The autopilot moved the local participant.
    AutopilotMoved { x: i32, y: i32 },
    /// The transport dropped and the room was re-joined.
    Reconnected,
    /// The session gave up. It is now in the Failed state.
    Failed { reason: String },
}

/// Non-blocking sender for [`SessionEvent`]s.
#[derive(Clone)]
pub(crate) struct EventSink {
    tx: mpsc::Sender<SessionEvent>,
    /// Where a reliable event waits when the channel is full
    runtime: Handle,
}

impl EventSink {
    pub(crate) fn new(tx: mpsc::Sender<SessionEvent>, runtime: Handle) -> Self {
        Self { tx, runtime }
    }

    /// Drop the event if the embedder is not keeping up.
    pub(crate) fn emit(&self, event: SessionEvent) {
        match self.tx.try_send(event) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(event)) => {
                log::trace!("Event channel full, dropping {event:?}");
            }
        }
    }

    /// Deliver even if the channel is full, by waiting on the session runtime.
    /// Safe to call from any thread.
    pub(crate) fn emit_reliable(&self, event: SessionEvent) {
        match self.tx.try_send(event) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(event)) => {
                log::debug!("Event channel full, queueing {event:?}");
                let tx = self.tx.clone();
                self.runtime.spawn(async move {
                    let _ = tx.send(event).await;
                });
            }
        }
    }
}

/// State shared between the facade, the I/O loop and the autopilot.
pub(crate) struct Shared {
    pub peer_id: Uuid,
    pub config: EngineConfig,
    pub lifecycle: Lifecycle,
    pub roster: PositionRoster,
    pub pointer: Arc<LocalPointer>,
    /// Packed `0xRRGGBB`; derived from the id, then confirmed by the relay
    pub local_color: AtomicU32,
    pub events: EventSink,
    pub joins_sent: AtomicU64,
    pub next_seq: AtomicU64,
    pub malformed_frames: AtomicU64,
    last_error: Mutex<Option<EngineError>>,
}

impl Shared {
    pub(crate) fn new(config: EngineConfig, events: EventSink) -> Self {
        let peer_id = Uuid::new_v4();
        Self {
            peer_id,
            config,
            lifecycle: Lifecycle::new(),
            roster: PositionRoster::new(),
            pointer: Arc::new(LocalPointer::new()),
            local_color: AtomicU32::new(color_from_id(peer_id)),
            events,
            joins_sent: AtomicU64::new(0),
            next_seq: AtomicU64::new(0),
            malformed_frames: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    pub(crate) fn record_error(&self, error: EngineError) {
        *lock(&self.last_error) = Some(error);
    }

    pub(crate) fn last_error(&self) -> Option<EngineError> {
        lock(&self.last_error).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Join requests sent, including re-joins
    pub joins_sent: u64,
    pub positions_sent: u64,
    /// Inbound frames dropped because they did not decode
    pub malformed_frames: u64,
    pub participants: usize,
}

/// A bubbles session.
pub struct Session {
    shared: Arc<Shared>,
    handle: Handle,
    /// Only taken in `Drop`
    runtime: Option<Runtime>,
    commands: Mutex<Option<mpsc::Sender<IoCommand>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    plotter: Mutex<Plotter>,
    frame: Mutex<Frame>,
    event_rx: Mutex<Option<mpsc::Receiver<SessionEvent>>>,
}

impl Session {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.io_threads.max(1))
            .thread_name("bubbles-io")
            .enable_all()
            .build()
            .map_err(|e| EngineError::Transport(format!("failed to start I/O runtime: {e}")))?;
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let handle = runtime.handle().clone();
        let events = EventSink::new(event_tx, handle.clone());

        Ok(Self {
            shared: Arc::new(Shared::new(config, events)),
            handle,
            runtime: Some(runtime),
            commands: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            plotter: Mutex::new(Plotter::new()),
            frame: Mutex::new(Frame::default()),
            event_rx: Mutex::new(Some(event_rx)),
        })
    }

    pub fn with_defaults() -> Result<Self, EngineError> {
        Self::new(EngineConfig::default())
    }

    /// Participant id, unique per session.
    pub fn id(&self) -> Uuid {
        self.shared.peer_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn state(&self) -> LifecycleState {
        self.shared.lifecycle.state()
    }

    /// Observe lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.shared.lifecycle.subscribe()
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&self) -> Option<mpsc::Receiver<SessionEvent>> {
        lock(&self.event_rx).take()
    }

    /// Why the session failed, if it did.
    pub fn last_error(&self) -> Option<EngineError> {
        self.shared.last_error()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            joins_sent: self.shared.joins_sent.load(Ordering::Relaxed),
            positions_sent: self.shared.next_seq.load(Ordering::Relaxed),
            malformed_frames: self.shared.malformed_frames.load(Ordering::Relaxed),
            participants: self.shared.roster.len(),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Connect, join the room and spawn the I/O loop.
    ///
    /// Credentials are checked before any network access. Connect and
    /// handshake are each bounded by their configured timeout, and a
    /// concurrent [`stop`](Self::stop) makes this call give up.
    pub fn start(
        &self,
        endpoint: &SessionEndpoint,
        credentials: &CredentialBundle,
    ) -> Result<(), EngineError> {
        self.shared
            .lifecycle
            .transition("start", LifecycleState::Starting)?;

        let result = self.launch(endpoint, credentials);
        if let Err(e) = &result {
            log::error!("Session start failed: {e}");
            // An abandoned start already sits in Stopped.
            if !matches!(e, EngineError::State { .. }) {
                self.shared.record_error(e.clone());
                self.shared.lifecycle.fail();
            }
        }
        result
    }

    fn prepare(
        &self,
        endpoint: &SessionEndpoint,
        credentials: &CredentialBundle,
    ) -> Result<Target, EngineError> {
        let config = &self.shared.config;
        let address = transport::resolve_address(&endpoint.address, config.default_port)?;
        let room = endpoint.room.trim();
        if room.is_empty() {
            return Err(EngineError::Handshake("room name is empty".into()));
        }
        let tls = match endpoint.security {
            SecurityMode::Plain => None,
            SecurityMode::MutualTls => Some(ClientTls::new(credentials, &config.tls_server_name)?),
        };
        Ok(Target {
            address,
            room: room.to_string(),
            compression: Compression::requested(endpoint.compressed),
            tls,
        })
    }

    fn launch(
        &self,
        endpoint: &SessionEndpoint,
        credentials: &CredentialBundle,
    ) -> Result<(), EngineError> {
        let target = self.prepare(endpoint, credentials)?;
        let shared = self.shared.clone();
        let mut state_rx = shared.lifecycle.subscribe();

        let outcome = self.handle.block_on(async {
            tokio::select! {
                r = connection::establish(&shared, &target) => Some(r),
                _ = state_rx.wait_for(|s| s.is_terminal()) => None,
            }
        });
        let link = match outcome {
            Some(result) => result?,
            None => return Err(EngineError::state("start", self.state())),
        };
        self.activate(target, link, endpoint.autopilot)
    }

    /// Go Running on a joined link and spawn the background tasks.
    ///
    /// A stop that landed after the join gets the link closed instead.
    fn activate(&self, target: Target, link: Link, autopilot: bool) -> Result<(), EngineError> {
        let shared = &self.shared;
        shared.local_color.store(link.color, Ordering::Relaxed);
        if let Err(e) = shared.lifecycle.transition("start", LifecycleState::Running) {
            self.handle.block_on(link.close());
            return Err(e);
        }

        let (command_tx, command_rx) = mpsc::channel(4);
        *lock(&self.commands) = Some(command_tx);

        let mut tasks = lock(&self.tasks);
        tasks.push(
            self.handle
                .spawn(connection::run(shared.clone(), target, link, command_rx)),
        );
        if autopilot {
            tasks.push(self.handle.spawn(autopilot::drive(
                AutopilotPath::new(shared.peer_id),
                shared.pointer.clone(),
                shared.lifecycle.subscribe(),
                shared.events.clone(),
                shared.config.autopilot_tick,
            )));
        }
        Ok(())
    }

    /// Suspend I/O without closing the transport.
    pub fn pause(&self) -> Result<(), EngineError> {
        if self.state() == LifecycleState::Paused {
            return Ok(());
        }
        self.shared
            .lifecycle
            .transition("pause", LifecycleState::Paused)
            .map(|_| ())
    }

    /// Re-arm I/O after a pause.
    ///
    /// Waits (up to `resume_timeout`) until the link is known to be live,
    /// re-joining first if the relay dropped it while paused.
    pub fn resume(&self) -> Result<(), EngineError> {
        match self.state() {
            LifecycleState::Running => return Ok(()),
            LifecycleState::Paused => {}
            state => return Err(EngineError::state("resume", state)),
        }
        let Some(commands) = lock(&self.commands).clone() else {
            return Err(EngineError::state("resume", self.state()));
        };
        self.shared
            .lifecycle
            .transition("resume", LifecycleState::Running)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        if commands.try_send(IoCommand::Resume(reply_tx)).is_err() {
            return Err(EngineError::Transport("I/O loop is not accepting commands".into()));
        }

        let timeout = self.shared.config.resume_timeout;
        match self
            .handle
            .block_on(async { tokio::time::timeout(timeout, reply_rx).await })
        {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(EngineError::state("resume", self.state())),
            Err(_) => {
                let error = EngineError::Transport("resume timed out".into());
                self.shared.record_error(error.clone());
                if self.shared.lifecycle.fail() {
                    self.shared.events.emit_reliable(SessionEvent::Failed {
                        reason: error.to_string(),
                    });
                }
                Err(error)
            }
        }
    }

    /// Tear everything down. Safe from any state, any number of times.
    pub fn stop(&self) {
        self.shared.lifecycle.stop();
        lock(&self.commands).take();
        self.shared.roster.clear();
        self.shared.pointer.reset();
    }

    // ── Local pointer ────────────────────────────────────────────────

    /// Report a new local logical position.
    pub fn move_to(&self, x: i32, y: i32) {
        self.shared.pointer.move_to(x, y);
    }

    pub fn touch_down(&self, x: i32, y: i32) {
        self.shared.pointer.touch_down(x, y);
    }

    pub fn touch_up(&self, x: i32, y: i32) {
        self.shared.pointer.touch_up(x, y);
    }

    pub fn pointer(&self) -> PointerSnapshot {
        self.shared.pointer.snapshot()
    }

    pub fn local_color(&self) -> u32 {
        self.shared.local_color.load(Ordering::Relaxed)
    }

    /// The local participant, mirroring the local pointer.
    pub fn local_participant(&self) -> Participant {
        let (x, y) = self.shared.pointer.position();
        Participant {
            id: self.shared.peer_id,
            x,
            y,
            color: self.local_color(),
        }
    }

    /// Point-in-time copy of the remote participants.
    pub fn participants(&self) -> Vec<Participant> {
        self.shared.roster.snapshot()
    }

    // ── Viewport ─────────────────────────────────────────────────────

    pub fn set_frame(&self, width: i32, height: i32) {
        *lock(&self.frame) = Frame::new(width, height);
    }

    pub fn frame(&self) -> Frame {
        *lock(&self.frame)
    }

    // ── Plot cycle ───────────────────────────────────────────────────

    /// Snapshot the roster and open a plot cycle.
    pub fn plot_start(&self) -> Result<(), EngineError> {
        let mut plotter = lock(&self.plotter);
        if plotter.is_open() {
            return Err(ProtocolError::PlotAlreadyOpen.into());
        }
        let snapshot = PlotSnapshot::new(self.shared.roster.snapshot(), self.local_color());
        plotter.start(snapshot)?;
        Ok(())
    }

    pub fn plot_end(&self) -> Result<bool, EngineError> {
        Ok(lock(&self.plotter).end()?)
    }

    pub fn plot_x(&self) -> Result<i32, EngineError> {
        Ok(lock(&self.plotter).x()?)
    }

    pub fn plot_y(&self) -> Result<i32, EngineError> {
        Ok(lock(&self.plotter).y()?)
    }

    pub fn plot_color(&self) -> Result<u32, EngineError> {
        Ok(lock(&self.plotter).color()?)
    }

    /// Local color: the one captured by the open cycle, or the current one.
    pub fn plot_my_color(&self) -> u32 {
        lock(&self.plotter)
            .my_color()
            .unwrap_or_else(|_| self.local_color())
    }

    pub fn plot_next(&self) -> Result<(), EngineError> {
        Ok(lock(&self.plotter).next()?)
    }

    pub fn plot_done(&self) -> Result<(), EngineError> {
        Ok(lock(&self.plotter).done()?)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
        let tasks: Vec<_> = lock(&self.tasks).drain(..).collect();
        if Handle::try_current().is_ok() {
            // Blocking here would panic.
            if let Some(runtime) = self.runtime.take() {
                runtime.shutdown_background();
            }
            return;
        }
        // Let the I/O loop say goodbye to the relay.
        self.handle.block_on(async {
            let _ = tokio::time::timeout(Duration::from_millis(500), async {
                for task in tasks {
                    let _ = task.await;
                }
            })
            .await;
        });
    }
}
