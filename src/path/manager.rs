//! Path manager
//!
//! Process-wide registry mapping runtime names to paths. Everything is
//! serialized through one event stream: admission, deregistration, the
//! API enumeration and configuration reloads. Paths are created lazily on
//! first reference, except static-source paths which exist from startup.

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::auth::{authenticate, Acl, Credentials};
use crate::conf::{valid_path_name, Conf, PathConf, PathConfMap, PathPattern};
use crate::error::RelayError;
use crate::path::{Path, PathAuthor, PathHandle, PathMessage, PathState};
use crate::stream::Stream;
use std::sync::Arc;

/// One entry of the `/v1/paths/list` enumeration.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PathInfo {
    pub name: String,
    pub conf_name: String,
    pub source: Option<PathPeerInfo>,
    pub source_ready: bool,
    pub tracks: Vec<String>,
    pub readers: Vec<PathPeerInfo>,
    pub bytes_received: u64,
}

/// A publisher or reader in API listings.
#[derive(Debug, Clone, Serialize)]
pub struct PathPeerInfo {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub id: String,
}

pub(crate) enum ManagerMessage {
    PublisherAdd {
        path_name: String,
        author: PathAuthor,
        credentials: Credentials,
        respond: oneshot::Sender<Result<PathHandle, RelayError>>,
    },
    ReaderAdd {
        path_name: String,
        author: PathAuthor,
        credentials: Credentials,
        respond: oneshot::Sender<Result<(PathHandle, Arc<Stream>), RelayError>>,
    },
    PathClosed {
        name: String,
        instance: u64,
    },
    Reload {
        conf: Conf,
    },
    PathsList {
        respond: oneshot::Sender<Vec<PathInfo>>,
    },
}

struct PathEntry {
    handle: PathHandle,
    conf_name: String,
    conf: PathConf,
    instance: u64,
    cancel: CancellationToken,
}

struct PathManager {
    conf: Conf,
    paths: HashMap<String, PathEntry>,
    self_tx: mpsc::UnboundedSender<ManagerMessage>,
    cancel: CancellationToken,
    next_instance: u64,
}

/// Cloneable reference to the manager's event stream.
#[derive(Clone)]
pub struct PathManagerHandle {
    tx: mpsc::UnboundedSender<ManagerMessage>,
}

impl PathManagerHandle {
    /// Spawn the manager task. Static-source paths in `conf` are created
    /// eagerly.
    pub fn spawn(conf: Conf, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut manager = PathManager {
            conf,
            paths: HashMap::new(),
            self_tx: tx.clone(),
            cancel: cancel.clone(),
            next_instance: 0,
        };
        tokio::spawn(async move {
            manager.create_static_paths();
            manager.run(rx, cancel).await;
        });
        Self { tx }
    }

    /// Admit a publisher: authenticate, locate or create the path, and
    /// reserve its publisher slot.
    pub async fn publisher_add(
        &self,
        path_name: &str,
        author: PathAuthor,
        credentials: Credentials,
    ) -> Result<PathHandle, RelayError> {
        let (respond, rx) = oneshot::channel();
        self.tx
            .send(ManagerMessage::PublisherAdd {
                path_name: path_name.to_string(),
                author,
                credentials,
                respond,
            })
            .map_err(|_| RelayError::Terminated)?;
        rx.await.map_err(|_| RelayError::Terminated)?
    }

    /// Admit a reader: authenticate, locate or create the path, and wait
    /// for its stream (which may mean waiting for an on-demand source).
    pub async fn reader_add(
        &self,
        path_name: &str,
        author: PathAuthor,
        credentials: Credentials,
    ) -> Result<(PathHandle, Arc<Stream>), RelayError> {
        let (respond, rx) = oneshot::channel();
        self.tx
            .send(ManagerMessage::ReaderAdd {
                path_name: path_name.to_string(),
                author,
                credentials,
                respond,
            })
            .map_err(|_| RelayError::Terminated)?;
        rx.await.map_err(|_| RelayError::Terminated)?
    }

    /// Apply a new configuration: unchanged paths are kept, changed or
    /// removed ones are closed (and static ones re-created).
    pub fn reload(&self, conf: Conf) {
        let _ = self.tx.send(ManagerMessage::Reload { conf });
    }

    pub async fn paths_list(&self) -> Vec<PathInfo> {
        let (respond, rx) = oneshot::channel();
        if self
            .tx
            .send(ManagerMessage::PathsList { respond })
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

impl PathManager {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<ManagerMessage>,
        cancel: CancellationToken,
    ) {
        tracing::debug!("path manager started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => self.handle_message(msg),
                    None => break,
                },
            }
        }
        // child tokens tear the paths down
        tracing::debug!("path manager stopped");
    }

    fn handle_message(&mut self, msg: ManagerMessage) {
        match msg {
            ManagerMessage::PublisherAdd {
                path_name,
                author,
                credentials,
                respond,
            } => {
                match self.admit(&path_name, &credentials, Acl::publish) {
                    Ok(handle) => {
                        let forwarded = handle.send(PathMessage::PublisherAdd {
                            author,
                            query: credentials.query,
                            respond,
                        });
                        if !forwarded {
                            // path task died between lookup and send;
                            // the dropped responder surfaces Terminated
                            self.paths.remove(&path_name);
                        }
                    }
                    Err(err) => {
                        let _ = respond.send(Err(err));
                    }
                }
            }
            ManagerMessage::ReaderAdd {
                path_name,
                author,
                credentials,
                respond,
            } => match self.admit(&path_name, &credentials, Acl::read) {
                Ok(handle) => {
                    let forwarded = handle.send(PathMessage::ReaderAdd {
                        author,
                        query: credentials.query,
                        respond,
                    });
                    if !forwarded {
                        self.paths.remove(&path_name);
                    }
                }
                Err(err) => {
                    let _ = respond.send(Err(err));
                }
            },
            ManagerMessage::PathClosed { name, instance } => {
                if self
                    .paths
                    .get(&name)
                    .map(|e| e.instance == instance)
                    .unwrap_or(false)
                {
                    self.paths.remove(&name);
                }
            }
            ManagerMessage::Reload { conf } => self.reload(conf),
            ManagerMessage::PathsList { respond } => {
                let _ = respond.send(self.paths_list());
            }
        }
    }

    /// Authenticate and return the path handle, creating the path first if
    /// this is the first reference to a configured name.
    fn admit(
        &mut self,
        path_name: &str,
        credentials: &Credentials,
        acl_of: fn(&PathConf) -> Acl,
    ) -> Result<PathHandle, RelayError> {
        valid_path_name(path_name)
            .map_err(|e| RelayError::BadRequest(e.to_string()))?;

        let (conf_name, conf) = find_conf(&self.conf.paths, path_name).ok_or_else(|| {
            RelayError::BadRequest(format!("path '{path_name}' is not configured"))
        })?;
        let conf = conf.clone();

        authenticate(&acl_of(&conf), credentials).map_err(RelayError::Auth)?;

        if let Some(entry) = self.paths.get(path_name) {
            return Ok(entry.handle.clone());
        }
        Ok(self.create_path(path_name, conf_name, conf))
    }

    fn create_path(&mut self, name: &str, conf_name: String, conf: PathConf) -> PathHandle {
        self.next_instance += 1;
        let instance = self.next_instance;
        let cancel = self.cancel.child_token();
        let handle = Path::spawn(
            name,
            conf.clone(),
            instance,
            self.conf.read_buffer_count,
            self.self_tx.clone(),
            cancel.clone(),
        );
        self.paths.insert(
            name.to_string(),
            PathEntry {
                handle: handle.clone(),
                conf_name,
                conf,
                instance,
                cancel,
            },
        );
        handle
    }

    fn create_static_paths(&mut self) {
        let static_paths: Vec<(String, PathConf)> = self
            .conf
            .paths
            .iter()
            .filter(|(name, conf)| {
                conf.is_static_source()
                    && PathPattern::parse(name).map(|p| p.is_literal()).unwrap_or(false)
            })
            .map(|(name, conf)| (name.clone(), conf.clone()))
            .collect();
        for (name, conf) in static_paths {
            if !self.paths.contains_key(&name) {
                let conf_name = name.clone();
                self.create_path(&name, conf_name, conf);
            }
        }
    }

    fn reload(&mut self, conf: Conf) {
        self.conf = conf;

        let mut to_close = Vec::new();
        for (name, entry) in &self.paths {
            let keep = match find_conf(&self.conf.paths, name) {
                Some((conf_name, new_conf)) => {
                    conf_name == entry.conf_name && *new_conf == entry.conf
                }
                None => false,
            };
            if !keep {
                to_close.push(name.clone());
            }
        }
        for name in to_close {
            if let Some(entry) = self.paths.remove(&name) {
                tracing::info!(path = %name, "closing path (configuration changed)");
                entry.cancel.cancel();
            }
        }

        self.create_static_paths();
    }

    fn paths_list(&self) -> Vec<PathInfo> {
        let mut out: Vec<PathInfo> = self
            .paths
            .iter()
            .map(|(name, entry)| {
                let snapshot = entry.handle.snapshot();
                PathInfo {
                    name: name.clone(),
                    conf_name: entry.conf_name.clone(),
                    source: snapshot.source.map(|(kind, id)| PathPeerInfo {
                        kind: kind.as_str(),
                        id: id.to_string(),
                    }),
                    source_ready: snapshot.state == PathState::Ready,
                    tracks: snapshot.tracks,
                    readers: snapshot
                        .readers
                        .iter()
                        .map(|(kind, id)| PathPeerInfo {
                            kind: kind.as_str(),
                            id: id.to_string(),
                        })
                        .collect(),
                    bytes_received: entry.handle.bytes_received(),
                }
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

/// Resolve a runtime name against the configured patterns: longest
/// literal prefix wins, ties break by fewer wildcards, then declaration
/// order.
fn find_conf<'a>(paths: &'a PathConfMap, name: &str) -> Option<(String, &'a PathConf)> {
    let mut best: Option<(&String, &PathConf, usize, usize, usize)> = None;
    for (index, (pattern_name, conf)) in paths.iter().enumerate() {
        let Ok(pattern) = PathPattern::parse(pattern_name) else {
            continue;
        };
        if !pattern.matches(name) {
            continue;
        }
        let rank = (
            pattern.literal_prefix_len(),
            pattern.wildcard_count(),
            index,
        );
        let better = match &best {
            None => true,
            Some((_, _, prefix, wildcards, order)) => {
                (rank.0, std::cmp::Reverse(rank.1), std::cmp::Reverse(rank.2))
                    > (*prefix, std::cmp::Reverse(*wildcards), std::cmp::Reverse(*order))
            }
        };
        if better {
            best = Some((pattern_name, conf, rank.0, rank.1, rank.2));
        }
    }
    best.map(|(pattern_name, conf, _, _, _)| (pattern_name.clone(), conf))
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::auth::AuthProtocol;
    use crate::error::AuthFailure;
    use crate::media::{Codec, Format, Media, MediaKind};
    use crate::session::{SessionId, SessionKind};

    fn base_conf() -> Conf {
        let mut conf = Conf::default();
        conf.paths.insert("cam1".into(), PathConf::default());
        conf
    }

    fn creds() -> Credentials {
        Credentials::anonymous(
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            AuthProtocol::Rtsp,
        )
    }

    fn author() -> PathAuthor {
        PathAuthor::new(
            SessionId::new(),
            SessionKind::RtspSession,
            Arc::new(|| {}),
        )
    }

    fn closable_author(flag: &Arc<AtomicBool>) -> PathAuthor {
        let flag = Arc::clone(flag);
        PathAuthor::new(
            SessionId::new(),
            SessionKind::RtspSession,
            Arc::new(move || flag.store(true, Ordering::SeqCst)),
        )
    }

    fn test_medias() -> Vec<Media> {
        vec![Media::new(
            MediaKind::Video,
            vec![Format::new(Codec::H264, 96, 90000)],
        )]
    }

    #[test]
    fn test_find_conf_resolution() {
        let mut paths = PathConfMap::default();
        let mut a = PathConf::default();
        a.override_publisher = true;
        paths.insert("live/**".into(), PathConf::default());
        paths.insert("live/cam1".into(), a);
        paths.insert("live/*".into(), PathConf::default());

        // literal beats both patterns
        let (name, conf) = find_conf(&paths, "live/cam1").unwrap();
        assert_eq!(name, "live/cam1");
        assert!(conf.override_publisher);

        // equal literal prefix and wildcard count: declaration order wins
        let (name, _) = find_conf(&paths, "live/cam2").unwrap();
        assert_eq!(name, "live/**");

        // deeper name only matches the rest pattern
        let (name, _) = find_conf(&paths, "live/cam2/sub").unwrap();
        assert_eq!(name, "live/**");

        assert!(find_conf(&paths, "other/cam").is_none());
    }

    #[test]
    fn test_find_conf_declaration_order_breaks_ties() {
        let mut paths = PathConfMap::default();
        let mut first = PathConf::default();
        first.override_publisher = true;
        paths.insert("a/*/c".into(), first);
        paths.insert("a/*/d".into(), PathConf::default());

        // same literal prefix "a", same wildcard count: first declared wins
        let mut both = PathConfMap::default();
        let mut one = PathConf::default();
        one.override_publisher = true;
        both.insert("*/x".into(), one);
        both.insert("*/**".into(), PathConf::default());
        let (name, conf) = find_conf(&both, "q/x").unwrap();
        assert_eq!(name, "*/x");
        assert!(conf.override_publisher);
    }

    #[tokio::test]
    async fn test_unconfigured_path_rejected() {
        let manager = PathManagerHandle::spawn(base_conf(), CancellationToken::new());
        let result = manager.publisher_add("nope", author(), creds()).await;
        assert!(matches!(result, Err(RelayError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_publish_and_read() {
        let manager = PathManagerHandle::spawn(base_conf(), CancellationToken::new());

        let publisher = author();
        let p_id = publisher.id;
        let path = manager.publisher_add("cam1", publisher, creds()).await.unwrap();
        let stream = path.publisher_start(p_id, test_medias(), false).await.unwrap();

        let (_, reader_stream) = manager.reader_add("cam1", author(), creds()).await.unwrap();
        assert!(Arc::ptr_eq(&stream, &reader_stream));
    }

    #[tokio::test]
    async fn test_read_acl() {
        let mut conf = base_conf();
        let mut path_conf = PathConf::default();
        path_conf.read_user = "alice".into();
        path_conf.read_pass = "secret".into();
        conf.paths.insert("protected".into(), path_conf);
        let manager = PathManagerHandle::spawn(conf, CancellationToken::new());

        let result = manager.reader_add("protected", author(), creds()).await;
        assert!(matches!(
            result,
            Err(RelayError::Auth(AuthFailure::CredentialsMissing))
        ));

        let mut ok = creds();
        ok.user = "alice".into();
        ok.pass = "secret".into();
        // still fails: no one is publishing, but auth passed
        let result = manager.reader_add("protected", author(), ok).await;
        assert!(matches!(result, Err(RelayError::NoOnePublishing(_))));
    }

    #[tokio::test]
    async fn test_reload_closes_changed_path() {
        let manager = PathManagerHandle::spawn(base_conf(), CancellationToken::new());

        let p_closed = Arc::new(AtomicBool::new(false));
        let publisher = closable_author(&p_closed);
        let p_id = publisher.id;
        let path = manager.publisher_add("cam1", publisher, creds()).await.unwrap();
        path.publisher_start(p_id, test_medias(), false).await.unwrap();

        let mut new_conf = base_conf();
        let mut changed = PathConf::default();
        changed.read_user = "bob".into();
        changed.read_pass = "x".into();
        new_conf.paths.insert("cam1".into(), changed);
        manager.reload(new_conf);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(p_closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_reload_keeps_unchanged_path() {
        let manager = PathManagerHandle::spawn(base_conf(), CancellationToken::new());

        let p_closed = Arc::new(AtomicBool::new(false));
        let publisher = closable_author(&p_closed);
        let p_id = publisher.id;
        let path = manager.publisher_add("cam1", publisher, creds()).await.unwrap();
        path.publisher_start(p_id, test_medias(), false).await.unwrap();

        manager.reload(base_conf());
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!p_closed.load(Ordering::SeqCst));

        let list = manager.paths_list().await;
        assert_eq!(list.len(), 1);
        assert!(list[0].source_ready);
    }

    #[tokio::test]
    async fn test_paths_list() {
        let manager = PathManagerHandle::spawn(base_conf(), CancellationToken::new());

        let publisher = author();
        let p_id = publisher.id;
        let path = manager.publisher_add("cam1", publisher, creds()).await.unwrap();
        path.publisher_start(p_id, test_medias(), false).await.unwrap();

        let list = manager.paths_list().await;
        assert_eq!(list.len(), 1);
        let info = &list[0];
        assert_eq!(info.name, "cam1");
        assert_eq!(info.conf_name, "cam1");
        assert!(info.source_ready);
        assert_eq!(info.tracks, ["H264"]);
    }
}
