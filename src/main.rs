//! switchboard server binary
//!
//! Usage: `switchboard [config.json]`. The configuration path may also be
//! given through `SB_CONFIG`; without one, built-in defaults apply.
//!
//! Exit codes: 0 on clean shutdown, 1 on a configuration error at
//! startup, 2 on an irrecoverable runtime error.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use switchboard::conf::Conf;
use switchboard::core;

fn main() -> ExitCode {
    let conf_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("SB_CONFIG").ok())
        .map(PathBuf::from);

    let conf = match Conf::load(conf_path.as_deref()) {
        Ok(conf) => conf,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(1);
        }
    };

    init_logging(&conf.log_level);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "switchboard starting");

    match serve(conf, conf_path) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "irrecoverable error");
            ExitCode::from(2)
        }
    }
}

fn serve(conf: Conf, conf_path: Option<PathBuf>) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build the runtime")?;

    runtime.block_on(async {
        let cancel = CancellationToken::new();

        let signal_cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
                signal_cancel.cancel();
            }
        });

        core::run(conf, conf_path, cancel)
            .await
            .context("relay core failed")
    })
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("switchboard={level},warn")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
