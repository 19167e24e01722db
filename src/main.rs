use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use coeus::chat::{ChatService, RenderedAnswer};
use coeus::client::CoeusClient;
use coeus::ClientConfig;

/// How long a cancelled answer may take to wind down before it is cut off.
const STOP_GRACE: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(name = "coeus")]
#[command(about = "Chat with a Coeus document assistant from the terminal")]
struct Cli {
    /// Backend URL; defaults to COEUS_BASE_URL.
    #[arg(long)]
    base_url: Option<String>,
    /// Wait for the whole answer instead of streaming it.
    #[arg(long, default_value_t = false)]
    no_stream: bool,
    /// Ask a single question and exit.
    #[arg(long)]
    question: Option<String>,
    /// Export every answer as a document into this directory.
    #[arg(long)]
    export_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = ClientConfig::from_env();
    if let Some(base_url) = cli.base_url {
        config.base_url = base_url;
    }
    if cli.no_stream {
        config.stream = false;
    }

    if let Some(dir) = &cli.export_dir {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed creating {}", dir.display()))?;
    }

    let client = CoeusClient::new(config.base_url.clone())?;
    let mut chat = ChatService::new(&config, client);
    tracing::info!(base_url = %config.base_url, stream = config.stream, "coeus client ready");
    let mut interrupts = listen_for_interrupts();
    let export_dir = cli.export_dir.as_deref();

    if let Some(question) = cli.question {
        return ask_and_print(&mut chat, &question, export_dir, &mut interrupts).await;
    }

    println!("Ask a question. Ctrl-C stops an answer, or quits at the prompt.");
    println!("Commands: :retry, :clear, :quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut failed_question: Option<String> = None;

    prompt()?;
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            Some(()) = interrupts.recv() => {
                println!();
                break;
            }
        };
        let Some(line) = line else {
            break;
        };

        let input = line.trim();
        let question = match input {
            "" => None,
            ":quit" | ":q" => break,
            ":clear" => {
                let turns = chat.conversation().len();
                chat.clear();
                failed_question = None;
                println!("(conversation cleared, {turns} turns dropped)");
                None
            }
            ":retry" => {
                if failed_question.is_none() {
                    println!("(nothing to retry)");
                }
                failed_question.take()
            }
            other => Some(other.to_string()),
        };

        if let Some(question) = question {
            let asked = ask_and_print(&mut chat, &question, export_dir, &mut interrupts).await;
            if let Err(err) = asked {
                eprintln!("error: {err:#}");
                failed_question = Some(question);
            }
        }
        prompt()?;
    }

    Ok(())
}

/// Forwards every Ctrl-C for the rest of the process lifetime. The default
/// SIGINT handler no longer applies once this runs.
fn listen_for_interrupts() -> mpsc::UnboundedReceiver<()> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if tx.send(()).is_err() {
                break;
            }
        }
    });
    rx
}

async fn ask_and_print(
    chat: &mut ChatService,
    question: &str,
    export_dir: Option<&Path>,
    interrupts: &mut mpsc::UnboundedReceiver<()>,
) -> Result<()> {
    let cancel = CancellationToken::new();
    let mut printer = StreamPrinter::default();

    let result = {
        let ask = chat.ask(question, &cancel, |rendered| printer.render(rendered));
        tokio::pin!(ask);
        tokio::select! {
            result = &mut ask => Some(result),
            Some(()) = interrupts.recv() => {
                cancel.cancel();
                tokio::time::timeout(STOP_GRACE, &mut ask).await.ok()
            }
        }
    };

    let Some(result) = result else {
        // The backend went quiet after the interrupt; keep what arrived.
        chat.settle_interrupted().await;
        println!();
        println!("(stopped)");
        return Ok(());
    };

    let outcome = result?;
    printer.finish(&outcome.answer);
    if outcome.cancelled {
        println!("(stopped)");
    }

    for link in outcome.answer.parsed.citation_links() {
        println!("  {}", link.label);
    }
    let followups = outcome.answer.followup_questions();
    if !followups.is_empty() {
        println!("Follow-up questions:");
        for followup in followups {
            println!("  - {followup}");
        }
    }

    let answered = !outcome.answer.envelope.content.is_empty();
    if let Some(dir) = export_dir.filter(|_| answered) {
        export_last_turn(chat, dir).await?;
    }

    Ok(())
}

async fn export_last_turn(chat: &ChatService, dir: &Path) -> Result<()> {
    let Some(turn) = chat.conversation().turns().last() else {
        return Ok(());
    };
    let request = chat.export_request(turn);
    if request.request_id.is_empty() {
        tracing::warn!("answer has no request id; skipping export");
        return Ok(());
    }

    let exported = chat.client().export_answer(&request).await?;
    let file_name = exported
        .file_name
        .unwrap_or_else(|| format!("{}.docx", request.request_id));
    let path = dir.join(file_name);
    tokio::fs::write(&path, &exported.bytes)
        .await
        .with_context(|| format!("failed writing {}", path.display()))?;
    println!("(exported to {})", path.display());
    Ok(())
}

/// Prints streamed text incrementally, only ever appending to the terminal.
#[derive(Default)]
struct StreamPrinter {
    printed: String,
}

impl StreamPrinter {
    fn render(&mut self, rendered: &RenderedAnswer) {
        let text = rendered.parsed.text_with_markers();
        if let Some(tail) = text.strip_prefix(self.printed.as_str()) {
            print!("{tail}");
            let _ = std::io::stdout().flush();
            self.printed = text;
        }
    }

    fn finish(&mut self, answer: &RenderedAnswer) {
        let text = answer.parsed.text_with_markers();
        match text.strip_prefix(self.printed.as_str()) {
            Some(tail) => println!("{tail}"),
            None if self.printed.is_empty() => println!("{text}"),
            None => println!(),
        }
        self.printed.clear();
    }
}

fn prompt() -> Result<()> {
    print!("> ");
    std::io::stdout().flush()?;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
