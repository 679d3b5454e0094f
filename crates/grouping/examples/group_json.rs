//! Groups newline-delimited JSON objects read from stdin.
//!
//! ```text
//! printf '{"text":"one"}\n{"text":"two"}\n{"text":"two"}\n' \
//!     | cargo run --example group_json -- --key text --with-count
//! ```
//!
//! Every worker thread runs a replica of the grouping stage.  The replicas
//! split the input between them, count into one shared map and write the
//! groups to stdout as JSON objects, in no particular order.

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam::channel::unbounded;
use grouping::{ChannelSource, GroupingConfig, GroupingOperator, Record, Runtime};
use std::io::{self, BufRead, Write};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Field to group by.  Repeat to group by several fields.
    #[clap(long = "key", required = true)]
    keys: Vec<String>,

    /// Append the number of records in each group.
    #[clap(long)]
    with_count: bool,

    /// Output the first record of each group instead of its key fields.
    #[clap(long)]
    retain_others: bool,

    /// Maximal number of distinct groups to keep track of (0 = unbounded).
    #[clap(long, default_value = "0")]
    max_types: i64,

    /// Number of threads.
    #[clap(long, default_value = "2")]
    threads: usize,
}

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .expect("valid default filter");

    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(env_filter)
        .try_init();
}

fn main() -> Result<()> {
    init_logging();
    grouping::metrics::describe_metrics();

    let Args {
        keys,
        with_count,
        retain_others,
        max_types,
        threads,
    } = Args::parse();

    let config = GroupingConfig::new(keys)
        .with_count(with_count)
        .retain_others(retain_others)
        .max_types(max_types);
    config.validate(None)?;

    let (input, receiver) = unbounded::<Record>();
    let (sender, output) = unbounded::<Record>();

    let hruntime = Runtime::run(threads, move || {
        let mut stage = GroupingOperator::new(config, ChannelSource::new(receiver))
            .expect("configuration was validated");
        while let Ok(Some(group)) = stage.next() {
            if sender.send(group).is_err() {
                break;
            }
        }
    });

    let mut records = 0;
    for (number, line) in io::stdin().lock().lines().enumerate() {
        let line = line.context("failed to read stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        let record: Record = serde_json::from_str(&line)
            .with_context(|| format!("line {}: expected a JSON object", number + 1))?;
        input.send(record)?;
        records += 1;
    }
    drop(input);

    hruntime.join()?;

    let mut stdout = io::stdout().lock();
    let mut groups = 0;
    for group in output.try_iter() {
        serde_json::to_writer(&mut stdout, &group)?;
        writeln!(stdout)?;
        groups += 1;
    }
    info!("grouped {records} records into {groups} groups using {threads} threads");

    Ok(())
}
