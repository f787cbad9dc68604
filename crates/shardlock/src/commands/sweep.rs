//! Sweep command - runs the expiration sweeper.

use std::sync::Arc;

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use shardlock_store::{
    ExpirationSweeper, ItemState, SessionEndSink, SessionStateProvider, SinkError,
    SweeperCoordinator,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::Context;

/// Arguments for the sweep command.
#[derive(Args, Debug)]
pub struct SweepArgs {
    /// Run a single sweep and exit
    #[arg(long)]
    pub once: bool,
}

#[derive(Debug, Serialize)]
struct SweepOutput {
    removed: usize,
    notify_failures: usize,
    skipped: bool,
}

/// Logs every session the sweeper ends.
fn logging_sink() -> Arc<dyn SessionEndSink> {
    Arc::new(
        |session_id: &str, state: &ItemState| -> std::result::Result<(), SinkError> {
            info!(
                session_id = %session_id,
                bytes = state.item.payload.len(),
                "Session ended"
            );
            Ok(())
        },
    )
}

/// Run the sweep command.
pub async fn run(args: SweepArgs, ctx: &Context) -> Result<()> {
    let (store_config, store) = shardlock_config::open_store(&ctx.config)?;

    if args.once {
        let sweeper = ExpirationSweeper::new(
            store_config.application.clone(),
            store.clone(),
            logging_sink(),
        );
        let report =
            tokio::task::spawn_blocking(move || sweeper.sweep_now(&CancellationToken::new()))
                .await??;

        if ctx.json_output {
            let output = SweepOutput {
                removed: report.removed,
                notify_failures: report.notify_failures,
                skipped: report.skipped,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        } else {
            println!(
                "removed {} session(s), {} callback failure(s)",
                report.removed, report.notify_failures
            );
        }
        return Ok(());
    }

    let interval = store_config.polling_interval;
    let provider = SessionStateProvider::open(
        store_config.with_expiration(true),
        store,
        logging_sink(),
        SweeperCoordinator::global(),
    )?;
    if !ctx.json_output {
        println!("sweeping every {}s, press Ctrl-C to stop", interval.as_secs());
    }

    tokio::signal::ctrl_c().await?;
    provider.shutdown();
    Ok(())
}
