//! Path: named rendezvous between one publisher and many readers
//!
//! A path exists as its own task with a typed inbox; every operation is a
//! message, so state transitions serialize without locks. The only shared
//! state is a snapshot mutex read by the control API.
//!
//! States: `waitingPublisher` ↔ `ready`. A path leaves `waitingPublisher`
//! when its publisher finalizes the track list (`publisher_start`), and
//! returns there when the publisher stops or drops. Teardown happens on
//! manager request, cancellation, or the last-reader idle timeout.

mod hooks;
pub mod manager;

pub use hooks::HookCmd;
pub use manager::{PathInfo, PathManagerHandle};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::conf::PathConf;
use crate::error::RelayError;
use crate::media::Media;
use crate::session::{SessionId, SessionKind};
use crate::stream::Stream;

/// Callback a path uses to tear down an attached session. Owning
/// direction: the path holds these; sessions hold only a [`PathHandle`]
/// back and must tolerate the path being gone.
pub type CloseFn = Arc<dyn Fn() + Send + Sync>;

/// A publisher or reader as seen by the path.
#[derive(Clone)]
pub struct PathAuthor {
    pub id: SessionId,
    pub kind: SessionKind,
    pub close: CloseFn,
}

impl PathAuthor {
    pub fn new(id: SessionId, kind: SessionKind, close: CloseFn) -> Self {
        Self { id, kind, close }
    }
}

impl std::fmt::Debug for PathAuthor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathAuthor")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathState {
    WaitingPublisher,
    Ready,
}

/// Observable state of a path, kept current by its task.
#[derive(Debug, Clone)]
pub struct PathSnapshot {
    pub state: PathState,
    pub source: Option<(SessionKind, SessionId)>,
    pub tracks: Vec<String>,
    pub readers: Vec<(SessionKind, SessionId)>,
    pub created: SystemTime,
    pub ready_at: Option<SystemTime>,
}

pub(crate) enum PathMessage {
    PublisherAdd {
        author: PathAuthor,
        query: String,
        respond: oneshot::Sender<Result<PathHandle, RelayError>>,
    },
    PublisherStart {
        id: SessionId,
        medias: Vec<Media>,
        generate_rtp_packets: bool,
        respond: oneshot::Sender<Result<Arc<Stream>, RelayError>>,
    },
    PublisherStop {
        id: SessionId,
    },
    PublisherRemove {
        id: SessionId,
    },
    ReaderAdd {
        author: PathAuthor,
        query: String,
        respond: oneshot::Sender<Result<(PathHandle, Arc<Stream>), RelayError>>,
    },
    ReaderRemove {
        id: SessionId,
    },
}

struct PathShared {
    conf: Mutex<PathConf>,
    snapshot: Mutex<PathSnapshot>,
    stream: Mutex<Option<Arc<Stream>>>,
    bytes_base: AtomicU64,
}

/// Cloneable reference to a path's inbox and observable state.
#[derive(Clone)]
pub struct PathHandle {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<PathMessage>,
    shared: Arc<PathShared>,
}

impl PathHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current policy. Immutable in practice: a policy edit replaces the
    /// whole path.
    pub fn safe_conf(&self) -> PathConf {
        self.shared.conf.lock().unwrap().clone()
    }

    pub fn snapshot(&self) -> PathSnapshot {
        self.shared.snapshot.lock().unwrap().clone()
    }

    /// Bytes received over the path's lifetime, across publisher changes.
    pub fn bytes_received(&self) -> u64 {
        let live = self
            .shared
            .stream
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.bytes_received())
            .unwrap_or(0);
        self.shared.bytes_base.load(Ordering::Relaxed) + live
    }

    /// Finalize the track list and create the stream; pending readers are
    /// flushed atomically before this returns.
    pub async fn publisher_start(
        &self,
        id: SessionId,
        medias: Vec<Media>,
        generate_rtp_packets: bool,
    ) -> Result<Arc<Stream>, RelayError> {
        let (respond, rx) = oneshot::channel();
        if self
            .tx
            .send(PathMessage::PublisherStart {
                id,
                medias,
                generate_rtp_packets,
                respond,
            })
            .is_err()
        {
            return Err(RelayError::Terminated);
        }
        rx.await.map_err(|_| RelayError::Terminated)?
    }

    /// Close the stream but keep the publisher slot (RTSP PAUSE while
    /// recording).
    pub fn publisher_stop(&self, id: SessionId) {
        let _ = self.tx.send(PathMessage::PublisherStop { id });
    }

    pub fn publisher_remove(&self, id: SessionId) {
        let _ = self.tx.send(PathMessage::PublisherRemove { id });
    }

    pub fn reader_remove(&self, id: SessionId) {
        let _ = self.tx.send(PathMessage::ReaderRemove { id });
    }

    pub(crate) fn send(&self, msg: PathMessage) -> bool {
        self.tx.send(msg).is_ok()
    }
}

/// Why the on-demand source machinery currently exists, if at all.
enum SourceState {
    Idle,
    /// Source launched (or expected), readers pending until the publisher
    /// starts or the deadline fails them.
    Waiting {
        cmd: Option<HookCmd>,
        deadline: Instant,
    },
    /// Publisher active. `stop_at` is armed while no readers are left.
    Active {
        cmd: Option<HookCmd>,
        stop_at: Option<Instant>,
    },
}

struct PendingReader {
    author: PathAuthor,
    respond: oneshot::Sender<Result<(PathHandle, Arc<Stream>), RelayError>>,
}

pub(crate) struct Path {
    name: Arc<str>,
    conf: PathConf,
    instance: u64,
    read_buffer_count: usize,
    handle: PathHandle,
    shared: Arc<PathShared>,
    manager_tx: mpsc::UnboundedSender<manager::ManagerMessage>,

    state: PathState,
    publisher: Option<PathAuthor>,
    publisher_query: String,
    stream: Option<Arc<Stream>>,
    readers: HashMap<SessionId, PathAuthor>,
    pending: Vec<PendingReader>,
    source: SourceState,

    created: SystemTime,
    ready_at: Option<SystemTime>,
    idle_deadline: Option<Instant>,

    on_init_cmd: Option<HookCmd>,
    on_publish_cmd: Option<HookCmd>,
    on_ready_cmd: Option<HookCmd>,
}

impl Path {
    /// Spawn a path task and return its handle.
    pub(crate) fn spawn(
        name: &str,
        conf: PathConf,
        instance: u64,
        read_buffer_count: usize,
        manager_tx: mpsc::UnboundedSender<manager::ManagerMessage>,
        cancel: CancellationToken,
    ) -> PathHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let name: Arc<str> = Arc::from(name);
        let shared = Arc::new(PathShared {
            conf: Mutex::new(conf.clone()),
            snapshot: Mutex::new(PathSnapshot {
                state: PathState::WaitingPublisher,
                source: None,
                tracks: Vec::new(),
                readers: Vec::new(),
                created: SystemTime::now(),
                ready_at: None,
            }),
            stream: Mutex::new(None),
            bytes_base: AtomicU64::new(0),
        });
        let handle = PathHandle {
            name: Arc::clone(&name),
            tx,
            shared: Arc::clone(&shared),
        };

        let path = Path {
            name,
            conf,
            instance,
            read_buffer_count,
            handle: handle.clone(),
            shared,
            manager_tx,
            state: PathState::WaitingPublisher,
            publisher: None,
            publisher_query: String::new(),
            stream: None,
            readers: HashMap::new(),
            pending: Vec::new(),
            source: SourceState::Idle,
            created: SystemTime::now(),
            ready_at: None,
            idle_deadline: None,
            on_init_cmd: None,
            on_publish_cmd: None,
            on_ready_cmd: None,
        };

        tokio::spawn(path.run(rx, cancel));
        handle
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<PathMessage>, cancel: CancellationToken) {
        tracing::info!(path = %self.name, "created");

        if !self.conf.run_on_init.is_empty() {
            self.on_init_cmd = Some(HookCmd::spawn(
                "runOnInit",
                &self.conf.run_on_init,
                self.conf.run_on_init_restart,
                &self.name,
                "",
            ));
        }
        self.rearm_idle();

        let reason = loop {
            let idle_deadline = self.idle_deadline;
            let source_deadline = self.source_deadline();

            tokio::select! {
                _ = cancel.cancelled() => break "terminated",
                msg = rx.recv() => match msg {
                    Some(msg) => self.handle_message(msg),
                    None => break "terminated",
                },
                _ = deadline(idle_deadline) => {
                    if self.should_idle_close() {
                        break "not in use";
                    }
                    self.idle_deadline = None;
                }
                _ = deadline(source_deadline) => self.handle_source_deadline(),
            }
            self.update_snapshot();
        };

        self.finalize(reason);
    }

    fn handle_message(&mut self, msg: PathMessage) {
        match msg {
            PathMessage::PublisherAdd {
                author,
                query,
                respond,
            } => self.handle_publisher_add(author, query, respond),
            PathMessage::PublisherStart {
                id,
                medias,
                generate_rtp_packets,
                respond,
            } => self.handle_publisher_start(id, medias, generate_rtp_packets, respond),
            PathMessage::PublisherStop { id } => self.handle_publisher_stop(id),
            PathMessage::PublisherRemove { id } => self.handle_publisher_remove(id),
            PathMessage::ReaderAdd {
                author,
                query,
                respond,
            } => self.handle_reader_add(author, query, respond),
            PathMessage::ReaderRemove { id } => self.handle_reader_remove(id),
        }
    }

    fn handle_publisher_add(
        &mut self,
        author: PathAuthor,
        query: String,
        respond: oneshot::Sender<Result<PathHandle, RelayError>>,
    ) {
        if let Some(existing) = self.publisher.take() {
            if !self.conf.override_publisher {
                self.publisher = Some(existing);
                let _ = respond.send(Err(RelayError::AlreadyInUse(self.name.to_string())));
                return;
            }
            tracing::info!(path = %self.name, publisher = %existing.id, "closing existing publisher (displaced)");
            self.set_not_ready();
            self.on_publish_cmd = None;
            (existing.close)();
        }

        tracing::debug!(path = %self.name, publisher = %author.id, "publisher admitted");
        self.publisher = Some(author);
        self.publisher_query = query;
        if !self.conf.run_on_publish.is_empty() {
            self.on_publish_cmd = Some(HookCmd::spawn(
                "runOnPublish",
                &self.conf.run_on_publish,
                self.conf.run_on_publish_restart,
                &self.name,
                &self.publisher_query,
            ));
        }
        self.rearm_idle();
        let _ = respond.send(Ok(self.handle.clone()));
    }

    fn handle_publisher_start(
        &mut self,
        id: SessionId,
        medias: Vec<Media>,
        generate_rtp_packets: bool,
        respond: oneshot::Sender<Result<Arc<Stream>, RelayError>>,
    ) {
        match &self.publisher {
            Some(publisher) if publisher.id == id => {}
            _ => {
                let _ = respond.send(Err(RelayError::BadRequest(
                    "publisher is not assigned to this path".into(),
                )));
                return;
            }
        }
        if self.stream.is_some() {
            let _ = respond.send(Err(RelayError::BadRequest(
                "publisher already started".into(),
            )));
            return;
        }

        let stream = Stream::new(medias, self.read_buffer_count, generate_rtp_packets);
        self.stream = Some(Arc::clone(&stream));
        *self.shared.stream.lock().unwrap() = Some(Arc::clone(&stream));
        self.state = PathState::Ready;
        self.ready_at = Some(SystemTime::now());

        // no reader observes the path half-flushed: everything below
        // happens before any other message
        for pending in self.pending.drain(..) {
            self.readers.insert(pending.author.id, pending.author.clone());
            let _ = pending
                .respond
                .send(Ok((self.handle.clone(), Arc::clone(&stream))));
        }

        if !self.conf.run_on_ready.is_empty() {
            self.on_ready_cmd = Some(HookCmd::spawn(
                "runOnReady",
                &self.conf.run_on_ready,
                self.conf.run_on_ready_restart,
                &self.name,
                &self.publisher_query,
            ));
        }

        self.source = match std::mem::replace(&mut self.source, SourceState::Idle) {
            SourceState::Waiting { cmd, .. } => SourceState::Active { cmd, stop_at: None },
            other => other,
        };
        self.rearm_idle();
        self.rearm_source_stop();

        let _ = respond.send(Ok(stream));
    }

    fn handle_publisher_stop(&mut self, id: SessionId) {
        if self.publisher.as_ref().map(|p| p.id) != Some(id) {
            return;
        }
        self.set_not_ready();
        self.rearm_idle();
    }

    fn handle_publisher_remove(&mut self, id: SessionId) {
        if self.publisher.as_ref().map(|p| p.id) != Some(id) {
            return;
        }
        self.set_not_ready();
        self.publisher = None;
        self.publisher_query.clear();
        self.on_publish_cmd = None;
        self.rearm_idle();
    }

    fn handle_reader_add(
        &mut self,
        author: PathAuthor,
        query: String,
        respond: oneshot::Sender<Result<(PathHandle, Arc<Stream>), RelayError>>,
    ) {
        match self.state {
            PathState::Ready => {
                let stream = self
                    .stream
                    .as_ref()
                    .map(Arc::clone)
                    .expect("ready path always has a stream");
                self.readers.insert(author.id, author);
                if let SourceState::Active { stop_at, .. } = &mut self.source {
                    *stop_at = None;
                }
                self.rearm_idle();
                let _ = respond.send(Ok((self.handle.clone(), stream)));
            }
            PathState::WaitingPublisher => {
                if !self.conf.is_static_source() && !self.conf.has_on_demand_source() {
                    let _ = respond.send(Err(if self.conf.fallback.is_empty() {
                        RelayError::NoOnePublishing(self.name.to_string())
                    } else {
                        RelayError::Redirect(self.conf.fallback.clone())
                    }));
                    return;
                }
                self.ensure_source_started(&query);
                self.pending.push(PendingReader { author, respond });
                self.rearm_idle();
            }
        }
    }

    fn handle_reader_remove(&mut self, id: SessionId) {
        if self.readers.remove(&id).is_none() {
            self.pending.retain(|p| p.author.id != id);
        }
        self.rearm_source_stop();
        self.rearm_idle();
    }

    fn ensure_source_started(&mut self, query: &str) {
        // an eager static source runs regardless of readers; pending
        // readers wait for its connector without a deadline
        if !self.conf.has_on_demand_source() {
            return;
        }

        match &mut self.source {
            SourceState::Idle => {}
            SourceState::Waiting { .. } => return,
            SourceState::Active { stop_at, .. } => {
                *stop_at = None;
                return;
            }
        }

        let cmd = if !self.conf.run_on_demand.is_empty() {
            tracing::info!(path = %self.name, "on-demand source requested");
            Some(HookCmd::spawn(
                "runOnDemand",
                &self.conf.run_on_demand,
                self.conf.run_on_demand_restart,
                &self.name,
                query,
            ))
        } else {
            None
        };
        self.source = SourceState::Waiting {
            cmd,
            deadline: Instant::now() + self.conf.on_demand_start_timeout(),
        };
    }

    fn handle_source_deadline(&mut self) {
        match std::mem::replace(&mut self.source, SourceState::Idle) {
            SourceState::Waiting { cmd, .. } => {
                tracing::info!(path = %self.name, "source did not become ready in time");
                drop(cmd);
                for pending in self.pending.drain(..) {
                    let _ = pending
                        .respond
                        .send(Err(RelayError::NoOnePublishing(self.name.to_string())));
                }
            }
            SourceState::Active {
                cmd,
                stop_at: Some(_),
            } => {
                tracing::info!(path = %self.name, "on-demand source is no longer needed");
                drop(cmd);
            }
            other => self.source = other,
        }
        self.rearm_idle();
    }

    fn set_not_ready(&mut self) {
        if let Some(stream) = self.stream.take() {
            self.shared
                .bytes_base
                .fetch_add(stream.bytes_received(), Ordering::Relaxed);
            *self.shared.stream.lock().unwrap() = None;
            stream.close();
        }
        self.state = PathState::WaitingPublisher;
        self.ready_at = None;
        self.on_ready_cmd = None;

        // readers observe the closed stream; protocols that can do so
        // re-subscribe through a fresh readerAdd
        for (_, reader) in self.readers.drain() {
            (reader.close)();
        }

        self.source = match std::mem::replace(&mut self.source, SourceState::Idle) {
            SourceState::Active { cmd, .. } if self.conf.has_on_demand_source() => {
                SourceState::Waiting {
                    cmd,
                    deadline: Instant::now() + self.conf.on_demand_start_timeout(),
                }
            }
            SourceState::Active { .. } => SourceState::Idle,
            other => other,
        };
    }

    fn rearm_source_stop(&mut self) {
        if let SourceState::Active {
            cmd: Some(_),
            stop_at,
        } = &mut self.source
        {
            if self.readers.is_empty() && self.pending.is_empty() {
                if stop_at.is_none() {
                    *stop_at = Some(Instant::now() + self.conf.on_demand_close_after());
                }
            } else {
                *stop_at = None;
            }
        }
    }

    fn should_idle_close(&self) -> bool {
        self.publisher.is_none()
            && self.readers.is_empty()
            && self.pending.is_empty()
            && !self.conf.is_static_source()
            && matches!(self.source, SourceState::Idle)
    }

    fn rearm_idle(&mut self) {
        self.idle_deadline = if self.should_idle_close() {
            Some(Instant::now() + self.conf.idle_timeout())
        } else {
            None
        };
    }

    fn source_deadline(&self) -> Option<Instant> {
        match &self.source {
            SourceState::Waiting { deadline, .. } => Some(*deadline),
            SourceState::Active {
                stop_at: Some(t), ..
            } => Some(*t),
            _ => None,
        }
    }

    fn update_snapshot(&self) {
        let mut snapshot = self.shared.snapshot.lock().unwrap();
        snapshot.state = self.state;
        snapshot.source = self.publisher.as_ref().map(|p| (p.kind, p.id));
        snapshot.tracks = self
            .stream
            .as_ref()
            .map(|s| {
                s.medias()
                    .iter()
                    .flat_map(|m| m.formats.iter().map(|f| f.codec.name().to_string()))
                    .collect()
            })
            .unwrap_or_default();
        snapshot.readers = self.readers.values().map(|r| (r.kind, r.id)).collect();
        snapshot.created = self.created;
        snapshot.ready_at = self.ready_at;
    }

    fn finalize(mut self, reason: &str) {
        for pending in self.pending.drain(..) {
            let _ = pending.respond.send(Err(RelayError::Terminated));
        }
        self.set_not_ready();
        if let Some(publisher) = self.publisher.take() {
            (publisher.close)();
        }
        self.on_init_cmd = None;
        self.on_publish_cmd = None;
        self.source = SourceState::Idle;
        self.update_snapshot();

        let _ = self.manager_tx.send(manager::ManagerMessage::PathClosed {
            name: self.name.to_string(),
            instance: self.instance,
        });
        tracing::info!(path = %self.name, "destroyed ({reason})");
    }
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
