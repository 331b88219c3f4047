mod output;
mod repl;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rustyline::error::ReadlineError;
use tracing::info;
use tracing_subscriber::EnvFilter;

use deskmate::core::automation::{Automation, HostAutomation, RecordingAutomation};
use deskmate::core::handlers::{HandlerRegistry, HandlerSettings};
use deskmate::core::journal::Journal;
use deskmate::{Assistant, CodeExecutor, Config, ExecutionMode, IntentCatalogue, IntentMatcher, Reply};

use crate::output::Printer;
use crate::repl::Repl;

#[derive(Parser)]
#[command(name = "deskmate", version, about = "Natural-language desktop commands and a restricted code sandbox")]
struct Cli {
    /// Configuration file (defaults to ~/.deskmate/config.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Perform real automation instead of recording it
    #[arg(long, global = true)]
    live: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print the best intent match for TEXT as JSON without executing it
    Parse { text: Vec<String> },
    /// Run a code file in the sandbox and print the result as JSON
    Run {
        file: PathBuf,
        #[arg(long, default_value = "safe")]
        mode: String,
    },
    /// List the intent catalogue, or export it as a JSON schema
    Intents {
        #[arg(long)]
        export: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if cli.live {
        config.dry_run = false;
    }
    init_tracing(&config.log_level);

    let catalogue = Arc::new(load_catalogue(&config)?);
    info!(intents = catalogue.len(), fingerprint = %catalogue.fingerprint(), "catalogue loaded");

    match cli.command {
        Some(Command::Parse { text }) => parse_command(catalogue, &text.join(" ")),
        Some(Command::Run { file, mode }) => run_command(&config, &file, &mode).await,
        Some(Command::Intents { export }) => intents_command(&catalogue, export.as_deref()),
        None => interactive_mode(&config, catalogue).await,
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_catalogue(config: &Config) -> Result<IntentCatalogue> {
    let registry = HandlerRegistry::with_builtins(HandlerSettings::from_config(config));
    let catalogue = match &config.intents_file {
        Some(path) => IntentCatalogue::load_file(path, &registry)
            .with_context(|| format!("Failed to load intents from {}", path.display()))?,
        None => IntentCatalogue::builtin(&registry).context("Built-in intent catalogue is invalid")?,
    };
    Ok(catalogue)
}

fn parse_command(catalogue: Arc<IntentCatalogue>, text: &str) -> Result<()> {
    let matcher = IntentMatcher::new(catalogue);
    let json = match matcher.parse(text) {
        Some(parsed) => parsed.to_json(),
        None => serde_json::Value::Null,
    };
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

async fn run_command(config: &Config, file: &Path, mode: &str) -> Result<()> {
    let mode: ExecutionMode = mode.parse()?;
    let code = std::fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let executor = CodeExecutor::new(config);
    let result = executor.execute(&code, mode).await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}

fn intents_command(catalogue: &IntentCatalogue, export: Option<&Path>) -> Result<()> {
    match export {
        Some(path) => {
            std::fs::write(path, catalogue.to_schema_json()?)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            Printer::new().success(&format!("Wrote {} intents to {}", catalogue.len(), path.display()));
        }
        None => {
            let printer = Printer::new();
            printer.intents(&catalogue.summaries());
            printer.print_key_value("fingerprint", &catalogue.fingerprint(), 0);
        }
    }
    Ok(())
}

async fn interactive_mode(config: &Config, catalogue: Arc<IntentCatalogue>) -> Result<()> {
    // First Ctrl-C outside the prompt warns, the second one quits.
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
        eprintln!("\n[!] Press Ctrl-C again to quit");
    })
    .context("Error setting Ctrl-C handler")?;

    let mut repl = Repl::new(config.repl_history_path()).map_err(anyhow::Error::msg)?;

    let mut journal = Journal::new(config.journal_path());
    if let Err(e) = journal.load() {
        repl.printer().warning(&format!("Could not load journal: {}", e));
    }
    let automation: Arc<dyn Automation> = if config.dry_run {
        Arc::new(RecordingAutomation::new())
    } else {
        Arc::new(HostAutomation)
    };
    let mut assistant = Assistant::new(config, catalogue.clone(), automation, journal);

    repl.printer().header(&format!("deskmate v{}", env!("CARGO_PKG_VERSION")));
    println!("{} intents loaded. Type 'help' for commands, 'exit' to quit.", catalogue.len());
    if config.dry_run {
        repl.printer().info("Dry run: automation is recorded, not performed (use --live)");
    }

    loop {
        interrupted.store(false, Ordering::SeqCst);
        let line = match repl.read_line("deskmate> ") {
            Ok(Some(line)) => line,
            Ok(None) => continue,
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                repl.printer().error(&format!("Input error: {}", e));
                break;
            }
        };
        let input = line.trim();

        match input {
            "exit" | "quit" => break,
            "help" => print_help(repl.printer()),
            "intents" => repl.printer().intents(&catalogue.summaries()),
            "session" => session_command(&repl, &assistant).await,
            "session clear" => {
                if let Some(sandbox) = assistant.sandbox() {
                    sandbox.clear_session().await;
                }
                repl.printer().success("Session cleared");
            }
            "stats" => {
                let stats = assistant.journal().stats();
                repl.printer().print_key_value("total", &stats.total.to_string(), 2);
                repl.printer().print_key_value("succeeded", &stats.succeeded.to_string(), 2);
                repl.printer().print_key_value("failed", &stats.failed.to_string(), 2);
            }
            _ if input == "history" || input.starts_with("history ") => history_command(&repl, &assistant, input),
            _ => {
                let mut reply = assistant.handle(&line).await;
                if let Reply::NeedsConfirmation(parsed) = reply {
                    let question = format!("Run '{}' ({:.2})?", parsed.name(), parsed.confidence);
                    reply = if repl.confirm(&question) {
                        assistant.confirm(parsed).await
                    } else {
                        assistant.decline(parsed)
                    };
                }
                show_reply(repl.printer(), &reply);
            }
        }
    }

    assistant.shutdown();
    if let Err(e) = repl.save_history() {
        repl.printer().warning(&e);
    }
    repl.printer().info("Goodbye");
    Ok(())
}

fn show_reply(printer: &Printer, reply: &Reply) {
    match reply {
        Reply::Code(result) => printer.code_result(result),
        Reply::Executed { result, .. } => {
            if result.success {
                printer.success(&reply.message());
                if let Some(data) = &result.data {
                    printer.print_indented(&serde_json::to_string_pretty(data).unwrap_or_default(), 4);
                }
            } else {
                printer.error(&reply.message());
            }
        }
        Reply::NotUnderstood(Some((name, confidence))) => {
            printer.warning(&reply.message());
            printer.print_key_value("closest", &format!("{} ({:.2})", name, confidence), 4);
        }
        Reply::Declined(_) | Reply::NotUnderstood(None) | Reply::NeedsConfirmation(_) => printer.warning(&reply.message()),
        Reply::NoCode | Reply::CodeDisabled => printer.error(&reply.message()),
    }
}

async fn session_command(repl: &Repl, assistant: &Assistant) {
    let Some(sandbox) = assistant.sandbox() else {
        repl.printer().warning("Code execution is disabled");
        return;
    };
    let info = sandbox.session_info().await;
    repl.printer().header(&format!("Session ({} variables)", info.variable_count));
    for (name, value) in &info.variables {
        repl.printer().print_key_value(name, &value.to_string(), 2);
    }
    repl.printer().print_key_value("allowed modules", &info.allowed_modules.join(", "), 2);
    repl.printer().print_key_value("timeout", &format!("{}s", info.timeout), 2);
}

fn history_command(repl: &Repl, assistant: &Assistant, input: &str) {
    let rest = input.trim_start_matches("history").trim();
    let journal = assistant.journal();
    if let Some(query) = rest.strip_prefix("search") {
        let found = journal.search(query.trim());
        repl.printer().header(&format!("{} matching entries", found.len()));
        repl.printer().journal_entries(found);
        return;
    }
    let count = rest.parse::<usize>().unwrap_or(10);
    repl.printer().header(&format!("Last {} of {} entries", count.min(journal.len()), journal.len()));
    repl.printer().journal_entries(journal.last_n(count));
}

fn print_help(printer: &Printer) {
    printer.header("Commands");
    for (command, description) in [
        ("<request>", "natural-language command, e.g. 'take a screenshot'"),
        ("run this code: <code>", "run code in the persistent sandbox session"),
        ("```python ... ```", "multi-line code block"),
        ("intents", "list known intents"),
        ("history [n]", "last n journal entries (default 10)"),
        ("history search <text>", "journal entries mentioning text"),
        ("session", "show sandbox session variables"),
        ("session clear", "drop sandbox session variables"),
        ("stats", "journal success counts"),
        ("exit", "save and quit"),
    ] {
        printer.print_key_value(command, description, 2);
    }
}
