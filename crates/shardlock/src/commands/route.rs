//! Route command - shows which partition a session id lands on.

use anyhow::{Result, bail};
use clap::Args;
use serde::Serialize;
use shardlock_store::{MAX_PARTITIONS, PartitionRouter, session_hash};

use super::Context;

/// Arguments for the route command.
#[derive(Args, Debug)]
pub struct RouteArgs {
    /// Session id to route
    pub session_id: String,

    /// Partition count (default: from config)
    #[arg(short, long)]
    pub partitions: Option<usize>,
}

#[derive(Debug, Serialize)]
struct RouteOutput<'a> {
    session_id: &'a str,
    hash: i32,
    partitions: usize,
    partition: usize,
}

/// Run the route command.
pub fn run(args: RouteArgs, ctx: &Context) -> Result<()> {
    let partitions = args
        .partitions
        .unwrap_or(ctx.config.store.partition_count)
        .max(1);
    if partitions > MAX_PARTITIONS {
        bail!("partition count must be at most {MAX_PARTITIONS}, got {partitions}");
    }

    let partition = PartitionRouter::new(partitions).route(&args.session_id);
    if ctx.json_output {
        let output = RouteOutput {
            session_id: &args.session_id,
            hash: session_hash(&args.session_id),
            partitions,
            partition,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else if ctx.verbose {
        println!(
            "{} -> partition {partition} of {partitions} (hash {})",
            args.session_id,
            session_hash(&args.session_id)
        );
    } else {
        println!("{partition}");
    }
    Ok(())
}
