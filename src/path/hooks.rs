//! Hook process runner
//!
//! Paths and sessions launch external commands at lifecycle points
//! (`runOnReady`, `runOnRead`, `runOnDemand`, ...). A hook lives as long
//! as the state that triggered it; closing kills the process. Hooks with
//! restart semantics are respawned after a pause.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Pause before a restarting hook is respawned.
pub const RESTART_PAUSE: Duration = Duration::from_secs(5);

/// Environment variable carrying the runtime path name.
pub const ENV_PATH: &str = "SB_PATH";
/// Environment variable carrying the triggering request's raw query.
pub const ENV_QUERY: &str = "SB_QUERY";

/// A running hook command. Dropping or closing it kills the process.
#[derive(Debug)]
pub struct HookCmd {
    cancel: CancellationToken,
}

impl HookCmd {
    /// Spawn `cmdline` through the shell with `SB_PATH`/`SB_QUERY` set.
    /// `label` names the hook in logs (`runOnReady`, ...).
    pub fn spawn(
        label: &'static str,
        cmdline: &str,
        restart: bool,
        path_name: &str,
        query: &str,
    ) -> Self {
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let cmdline = cmdline.to_string();
        let path_name = path_name.to_string();
        let query = query.to_string();

        tracing::info!(path = %path_name, "{} command started", label);

        tokio::spawn(async move {
            loop {
                let mut command = tokio::process::Command::new("sh");
                command
                    .arg("-c")
                    .arg(&cmdline)
                    .env(ENV_PATH, &path_name)
                    .env(ENV_QUERY, &query)
                    .kill_on_drop(true);

                let mut child = match command.spawn() {
                    Ok(child) => child,
                    Err(err) => {
                        tracing::warn!(path = %path_name, error = %err, "{} command failed to start", label);
                        if !restart {
                            return;
                        }
                        if sleep_or_cancelled(&task_cancel, RESTART_PAUSE).await {
                            return;
                        }
                        continue;
                    }
                };

                tokio::select! {
                    status = child.wait() => {
                        let code = status.ok().and_then(|s| s.code()).unwrap_or(-1);
                        tracing::info!(path = %path_name, code = code, "{} command exited", label);
                        if !restart {
                            return;
                        }
                        if sleep_or_cancelled(&task_cancel, RESTART_PAUSE).await {
                            return;
                        }
                    }
                    _ = task_cancel.cancelled() => {
                        // kill_on_drop reaps the child
                        tracing::info!(path = %path_name, "{} command stopped", label);
                        return;
                    }
                }
            }
        });

        Self { cancel }
    }

    /// Kill the process and stop any restart loop. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for HookCmd {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Returns true if cancelled before the pause elapsed.
async fn sleep_or_cancelled(cancel: &CancellationToken, pause: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(pause) => false,
        _ = cancel.cancelled() => true,
    }
}
