//! Inspect command - shows the lock state of one session.

use anyhow::Result;
use clap::Args;
use console::Style;
use serde::Serialize;
use shardlock_store::{LockStatus, route};

use super::Context;

/// Arguments for the inspect command.
#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Session id to inspect
    pub session_id: String,
}

#[derive(Debug, Serialize)]
struct InspectOutput<'a> {
    application: &'a str,
    session_id: &'a str,
    partition: usize,
    state: &'static str,
    lock_token: Option<&'a str>,
    lock_acquired_at: Option<String>,
    lock_age_secs: Option<i64>,
}

/// Run the inspect command.
pub fn run(args: InspectArgs, ctx: &Context) -> Result<()> {
    let (store_config, store) = shardlock_config::open_store(&ctx.config)?;
    let application = store_config.application.as_str();
    let partition = route(&args.session_id, store_config.effective_partitions());
    let status = store.get_item_lock(application, &args.session_id)?;

    let held = match &status {
        LockStatus::Locked(cookie) => Some(cookie),
        _ => None,
    };
    let state = match &status {
        LockStatus::Missing => "missing",
        LockStatus::Unlocked => "unlocked",
        LockStatus::Locked(_) => "locked",
    };

    if ctx.json_output {
        let output = InspectOutput {
            application,
            session_id: &args.session_id,
            partition,
            state,
            lock_token: held.map(|c| c.token()),
            lock_acquired_at: held.map(|c| c.acquired_at().to_rfc3339()),
            lock_age_secs: held.map(|c| c.age(store.now()).num_seconds()),
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    let dim = Style::new().dim();
    match held {
        Some(cookie) => println!(
            "{} {}  {}",
            Style::new().yellow().apply_to("locked"),
            cookie,
            dim.apply_to(format!("held {}s", cookie.age(store.now()).num_seconds()))
        ),
        None => println!("{state}"),
    }
    if ctx.verbose {
        println!(
            "{}",
            dim.apply_to(format!("{application}/{} on partition {partition}", args.session_id))
        );
    }
    Ok(())
}
