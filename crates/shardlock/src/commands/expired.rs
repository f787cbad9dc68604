//! Expired command - lists expiration candidates per partition.

use anyhow::Result;
use clap::Args;
use serde::Serialize;

use super::Context;

/// Arguments for the expired command.
#[derive(Args, Debug)]
pub struct ExpiredArgs {
    /// Maximum candidates per partition
    #[arg(short, long, default_value_t = 16)]
    pub limit: usize,
}

#[derive(Debug, Serialize)]
struct CandidateOutput {
    partition: usize,
    session_id: String,
    expires_at: String,
}

/// Run the expired command.
pub fn run(args: ExpiredArgs, ctx: &Context) -> Result<()> {
    let (store_config, store) = shardlock_config::open_store(&ctx.config)?;
    let now = store.now();

    let mut rows = Vec::new();
    for index in 0..store.shard_count() {
        let Some(shard) = store.shard(index) else {
            continue;
        };
        for candidate in
            shard.get_session_end_candidates(&store_config.application, now, args.limit)?
        {
            rows.push(CandidateOutput {
                partition: index,
                session_id: candidate.session_id,
                expires_at: candidate.expires_at.to_rfc3339(),
            });
        }
    }

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else if rows.is_empty() {
        println!("no expired sessions");
    } else {
        for row in &rows {
            println!("{:>3}  {}  {}", row.partition, row.expires_at, row.session_id);
        }
    }
    Ok(())
}
