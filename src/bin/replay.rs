use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use futures_util::stream;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use coeus::chat::RenderedAnswer;
use coeus::models::ResolvedCitation;
use coeus::ndjson::ndjson_events;
use coeus::reducer::{ReducerConfig, StreamReducer};

#[derive(Parser, Debug)]
#[command(name = "replay")]
#[command(about = "Reduce a recorded NDJSON chat stream and print the resolved answer")]
struct Cli {
    /// Transcript captured from the /chat endpoint, one JSON event per line.
    #[arg(long)]
    file: String,
    /// Delay between rendered fragments, in milliseconds.
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,
    /// Stop consuming after this many content fragments.
    #[arg(long)]
    cancel_after: Option<usize>,
    /// Print every intermediate render as well as the final answer.
    #[arg(long, default_value_t = false)]
    verbose: bool,
    /// Emit the final answer as JSON.
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Serialize)]
struct ReplayReport {
    request_id: Option<String>,
    cancelled: bool,
    fragments: usize,
    content: String,
    markup: String,
    citations: Vec<ResolvedCitation>,
    followup_questions: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let bytes = tokio::fs::read(&cli.file)
        .await
        .with_context(|| format!("failed opening {}", cli.file))?;
    let source = stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from(bytes))]);
    let events = ndjson_events(source);

    let reducer = StreamReducer::new(ReducerConfig {
        render_delay: Duration::from_millis(cli.delay_ms),
    });
    let cancel = CancellationToken::new();
    let mut fragments = 0usize;

    let outcome = reducer
        .reduce(events, &cancel, |snapshot| {
            fragments += 1;
            if cli.verbose {
                let rendered = RenderedAnswer::new(snapshot, true);
                println!("[{fragments:>3}] {}", rendered.parsed.markup.replace('\n', " "));
            }
            if cli.cancel_after.is_some_and(|limit| fragments >= limit) {
                cancel.cancel();
            }
        })
        .await
        .with_context(|| format!("replay of {} failed", cli.file))?;

    let answer = RenderedAnswer::new(outcome.envelope, false);

    if cli.json {
        let report = ReplayReport {
            request_id: answer.envelope.request_id.clone(),
            cancelled: outcome.cancelled,
            fragments,
            content: answer.envelope.content.clone(),
            markup: answer.parsed.markup.clone(),
            citations: answer.parsed.resolved(),
            followup_questions: answer.followup_questions().to_vec(),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Request: {}", answer.envelope.request_id.as_deref().unwrap_or("-"));
    println!("Fragments: {fragments}{}", if outcome.cancelled { " (cancelled)" } else { "" });
    println!("Answer: {}", answer.parsed.markup);
    println!("Citations: {}", answer.parsed.citations.len());
    for link in answer.parsed.citation_links() {
        println!("  {} -> {}", link.label, link.source_path);
    }
    for followup in answer.followup_questions() {
        println!("Follow-up: {followup}");
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
