//! Component wiring and live reload
//!
//! Builds the path manager, the protocol servers and the control API for
//! a configuration, then waits for reloads. A reload always re-runs the
//! path diff; the servers and the API are restarted only when a setting
//! of theirs changed, since the commit may tear down the very listener
//! the mutation arrived on. On Unix, SIGHUP re-reads the configuration
//! file.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{self, ApiState, ServerSet};
use crate::conf::{parse_listen_addr, Conf};
use crate::error::RelayError;
use crate::path::PathManagerHandle;
use crate::session::hls::HlsServer;
use crate::session::rtmp::RtmpServer;
use crate::session::rtsp::RtspServer;
use crate::session::webrtc::WebRtcServer;

/// Idle linger before an unused HLS muxer is closed.
const HLS_MUXER_CLOSE_AFTER: Duration = Duration::from_secs(10);

/// Run the relay until `cancel` fires. `conf_path` is re-read on SIGHUP.
pub async fn run(
    mut conf: Conf,
    conf_path: Option<PathBuf>,
    cancel: CancellationToken,
) -> Result<(), RelayError> {
    let path_manager = PathManagerHandle::spawn(conf.clone(), cancel.child_token());
    let (reload_tx, mut reload_rx) = mpsc::unbounded_channel::<Conf>();

    let mut hup = hup_stream();

    'generation: loop {
        let generation = cancel.child_token();
        let servers = build_servers(&conf, &path_manager, &generation);

        let mut api_state = None;
        let mut api_task: Option<JoinHandle<std::io::Result<()>>> = None;
        if conf.api {
            let address = parse_listen_addr(&conf.api_address)
                .ok_or_else(|| RelayError::Internal("invalid API address".into()))?;
            let state = ApiState::new(
                conf.clone(),
                path_manager.clone(),
                servers.clone(),
                reload_tx.clone(),
            );
            api_state = Some(Arc::clone(&state));
            api_task = Some(tokio::spawn(api::serve(
                address,
                state,
                generation.clone(),
            )));
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    generation.cancel();
                    if let Some(task) = api_task.take() {
                        let _ = task.await;
                    }
                    tracing::info!("shutting down");
                    return Ok(());
                }
                result = poll_api(&mut api_task) => {
                    generation.cancel();
                    let message = match result {
                        Ok(Err(err)) => format!("API listener failed: {err}"),
                        Err(err) => format!("API task panicked: {err}"),
                        Ok(Ok(())) => "API listener exited unexpectedly".to_string(),
                    };
                    return Err(RelayError::Internal(message));
                }
                _ = hup_recv(&mut hup) => {
                    match Conf::load(conf_path.as_deref()) {
                        Ok(new_conf) => {
                            tracing::info!("reloading configuration (SIGHUP)");
                            let _ = reload_tx.send(new_conf);
                        }
                        Err(err) => {
                            tracing::error!(error = %err, "configuration reload failed");
                        }
                    }
                }
                new_conf = reload_rx.recv() => {
                    let Some(new_conf) = new_conf else {
                        return Ok(());
                    };
                    tracing::info!("applying new configuration");
                    path_manager.reload(new_conf.clone());
                    if let Some(state) = &api_state {
                        state_sync(state, &new_conf);
                    }
                    let restart = needs_restart(&conf, &new_conf);
                    conf = new_conf;
                    if restart {
                        generation.cancel();
                        if let Some(task) = api_task.take() {
                            let _ = task.await;
                        }
                        continue 'generation;
                    }
                }
            }
        }
    }
}

/// Whether a configuration change touches the servers or the API, forcing
/// the current generation to be rebuilt.
fn needs_restart(old: &Conf, new: &Conf) -> bool {
    old.api != new.api
        || old.api_address != new.api_address
        || old.rtsp != new.rtsp
        || old.rtsp_address != new.rtsp_address
        || old.rtsp_encryption != new.rtsp_encryption
        || old.rtmp != new.rtmp
        || old.rtmp_address != new.rtmp_address
        || old.rtmp_encryption != new.rtmp_encryption
        || old.hls != new.hls
        || old.hls_address != new.hls_address
        || old.webrtc != new.webrtc
        || old.webrtc_address != new.webrtc_address
        || old.webrtc_ice_servers != new.webrtc_ice_servers
        || old.read_buffer_count != new.read_buffer_count
}

fn build_servers(
    conf: &Conf,
    path_manager: &PathManagerHandle,
    cancel: &CancellationToken,
) -> ServerSet {
    ServerSet {
        rtsp: conf
            .rtsp
            .then(|| RtspServer::new(false, path_manager.clone(), cancel.child_token())),
        rtsps: (conf.rtsp && conf.rtsp_encryption)
            .then(|| RtspServer::new(true, path_manager.clone(), cancel.child_token())),
        rtmp: conf
            .rtmp
            .then(|| RtmpServer::new(false, path_manager.clone(), cancel.child_token())),
        rtmps: (conf.rtmp && conf.rtmp_encryption)
            .then(|| RtmpServer::new(true, path_manager.clone(), cancel.child_token())),
        webrtc: conf.webrtc.then(|| {
            WebRtcServer::new(
                conf.webrtc_ice_servers.clone(),
                path_manager.clone(),
                cancel.child_token(),
            )
        }),
        hls: conf.hls.then(|| {
            HlsServer::new(
                HLS_MUXER_CLOSE_AFTER,
                path_manager.clone(),
                cancel.child_token(),
            )
        }),
    }
}

fn state_sync(state: &Arc<ApiState>, conf: &Conf) {
    state.set_conf(conf.clone());
}

async fn poll_api(
    task: &mut Option<JoinHandle<std::io::Result<()>>>,
) -> Result<std::io::Result<()>, tokio::task::JoinError> {
    match task {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

#[cfg(unix)]
fn hup_stream() -> Option<tokio::signal::unix::Signal> {
    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()).ok()
}

#[cfg(not(unix))]
fn hup_stream() -> Option<()> {
    None
}

#[cfg(unix)]
async fn hup_recv(stream: &mut Option<tokio::signal::unix::Signal>) {
    match stream {
        Some(stream) => {
            stream.recv().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(not(unix))]
async fn hup_recv(_stream: &mut Option<()>) {
    std::future::pending().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_restart() {
        let old = Conf::default();
        let mut new = Conf::default();
        assert!(!needs_restart(&old, &new));

        new.log_level = "debug".into();
        assert!(!needs_restart(&old, &new));

        new.api_address = "127.0.0.1:9998".into();
        assert!(needs_restart(&old, &new));
    }

    #[tokio::test]
    async fn test_run_shuts_down_cleanly() {
        let cancel = CancellationToken::new();
        let mut conf = Conf::default();
        conf.api = false;

        let task = tokio::spawn(run(conf, None, cancel.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
