use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use podflux_ingest::{LogIngestionSource, SourceConfig};

/// Podflux - streams enriched logs from Kubernetes pods matching a filter
#[derive(Parser, Debug)]
#[command(name = "podflux")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Namespace to watch (repeatable); watches the whole cluster if omitted
    #[arg(short = 'n', long = "namespace", value_name = "NAMESPACE")]
    namespaces: Vec<String>,

    /// Label selector, e.g. "app=nginx,tier in (web,api)"
    #[arg(short = 'l', long, default_value = "")]
    selector: String,

    /// Kubeconfig context to use (defaults to the current context)
    #[arg(long)]
    context: Option<String>,

    /// Path to a kubeconfig file (defaults to standard resolution)
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Trailing log lines to fetch per container; negative fetches all
    #[arg(long, default_value = "10")]
    tail_lines: i64,

    /// Only include lines newer than this many seconds; 0 for no bound
    #[arg(long, default_value = "0")]
    since: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = SourceConfig {
        kubeconfig: args.kubeconfig,
        context: args.context,
        namespaces: args.namespaces,
        selector: args.selector,
        tail_lines: args.tail_lines,
        since_seconds: args.since,
    };

    let mut source = LogIngestionSource::new(config);
    let Some(mut records) = source.take_output() else {
        anyhow::bail!("log source output already consumed");
    };

    source.start().await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            record = records.recv() => match record {
                Some(record) => println!("{}", record.to_json()),
                None => break,
            },
        }
    }

    source.stop().await;
    Ok(())
}
