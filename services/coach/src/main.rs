use anyhow::{Context, Result};
use clap::Parser;
use lingo_coach::config::{Backend, Config};
use lingo_coach::console::{ConsoleInput, ConsoleOutput, Dictation};
use lingo_coach::gemini_adapter::GeminiAdapter;
use lingo_coach::openai_adapter::OpenAIAdapter;
use lingo_coach::prompt_loader;
use lingo_coach::render::{Renderer, activity_lines};
use lingo_coach::repl::{HELP, Line, parse_line};
use lingo_core::context::SessionContext;
use lingo_core::controller::{Phase, Snapshot};
use lingo_core::driver::{SessionDriver, Timings};
use lingo_core::evaluator::{Evaluator, ModelEvaluator};
use lingo_core::event::{Event, EventSender, UserAction};
use lingo_core::offline::OfflineEvaluator;
use lingo_core::prompts::PromptSet;
use lingo_core::store::FileStore;
use std::io::{BufRead, IsTerminal};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::ChronoLocal;

#[derive(Parser)]
#[command(version, about = "Spoken language coach: placement interview and roleplay practice")]
struct Cli {
    /// Directory of `.md` prompt templates overriding the built-in ones
    #[arg(long)]
    prompts: Option<PathBuf>,
    /// Use the local evaluator instead of a hosted model
    #[arg(long)]
    offline: bool,
    /// Where the level preference is stored (overrides LINGO_DATA_DIR)
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Accept dictation even when stdin is not a terminal
    #[arg(long)]
    piped: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // --- 1. Parse Command-Line Arguments ---
    let args = Cli::parse();

    // --- 2. Load Configuration ---
    let config = Config::from_env(args.offline).context("Failed to load application configuration")?;

    // --- 3. Initialize Logging ---
    // Logs go to stderr; stdout belongs to the conversation.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&config.log_filter))
        .with_timer(ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();

    tracing::info!(
        "Configuration loaded successfully. Evaluator: {} ({})",
        config.backend.name(),
        config.chat_model
    );

    // --- 4. Load Prompts ---
    let prompts = match &args.prompts {
        Some(dir) => prompt_loader::load_prompt_set(dir).context("Failed to load LLM prompts")?,
        None => PromptSet::default(),
    };

    // --- 5. Initialize the Evaluator ---
    let evaluator: Arc<dyn Evaluator> = match config.backend {
        Backend::Gemini { api_key } => Arc::new(ModelEvaluator::new(
            GeminiAdapter::new(api_key, &config.chat_model),
            prompts,
        )),
        Backend::OpenAI { api_key } => Arc::new(ModelEvaluator::new(
            OpenAIAdapter::new(api_key, &config.chat_model),
            prompts,
        )),
        Backend::Offline => Arc::new(OfflineEvaluator),
    };

    // --- 6. Session Setup ---
    let data_dir = args.data_dir.unwrap_or(config.data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;
    let store = FileStore::in_dir(&data_dir);
    tracing::info!("Preferences stored at {}", store.path().display());
    let ctx = SessionContext::init(Box::new(store));

    let input = ConsoleInput::new(std::io::stdin().is_terminal() || args.piped);
    let dictation = input.dictation();
    let output = ConsoleOutput::detect();

    let driver = SessionDriver::new(
        ctx,
        evaluator,
        Box::new(input),
        Box::new(output),
        Timings::default(),
    );
    let events = driver.events();
    let render_rx = driver.subscribe();
    let repl_rx = driver.subscribe();
    let session = tokio::spawn(driver.run());

    // This task prints whatever changed after each processed event.
    let renderer = tokio::spawn(async move {
        let mut rx = render_rx;
        let mut renderer = Renderer::default();
        loop {
            let snap = rx.borrow_and_update().clone();
            for line in renderer.render(&snap) {
                println!("{line}");
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
    });

    let repl = tokio::spawn(read_lines(
        spawn_stdin_reader(),
        events.clone(),
        dictation,
        repl_rx,
    ));

    tokio::select! {
        _ = repl => {},
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl-C, shutting down...");
        }
    }

    if let Err(e) = events.send(Event::Shutdown).await {
        tracing::warn!("Failed to send shutdown event: {:?}", e);
    }
    let controller = session.await.context("Session task failed")?;
    renderer.abort();
    tracing::info!(
        "Shutting down... level: {:?}",
        controller.context().level()
    );
    Ok(())
}

/// Blocking stdin reads live on their own thread so a pending read never
/// holds up runtime shutdown.
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to read from stdin: {:?}", e);
                    break;
                }
            }
        }
        tracing::info!("End of input.");
    });
    rx
}

/// Turns each input line into a user action or dictation. Returns on
/// `/quit` or end of input.
async fn read_lines(
    mut lines: mpsc::Receiver<String>,
    events: EventSender,
    dictation: Dictation,
    mut snapshots: watch::Receiver<Snapshot>,
) {
    while let Some(line) = lines.recv().await {
        let action = match parse_line(&line) {
            Line::Action(action) => action,
            Line::Speech(text) => {
                if dictation.dictate(&text) {
                    continue;
                }
                let snap = snapshots.borrow().clone();
                let can_record = snap.view.is_conversational()
                    && matches!(snap.phase, Phase::Idle | Phase::Reviewing { .. });
                if !can_record {
                    println!("(not your turn yet; /help lists the commands)");
                    continue;
                }
                if let Err(e) = events.send(Event::User(UserAction::StartListening)).await {
                    tracing::error!("Session is gone, stopping input: {:?}", e);
                    break;
                }
                if !dictation.dictate_when_listening(&mut snapshots, &text).await {
                    println!("(the microphone did not open; that line was not recorded)");
                }
                continue;
            }
            Line::Help => {
                println!("{HELP}");
                continue;
            }
            Line::Log => {
                let snap = snapshots.borrow().clone();
                for line in activity_lines(&snap) {
                    println!("{line}");
                }
                continue;
            }
            Line::Quit => break,
            Line::Blank => continue,
            Line::Unknown(command) => {
                println!("Unknown command {command}; /help lists the commands.");
                continue;
            }
        };

        if let Err(e) = events.send(Event::User(action)).await {
            tracing::error!("Session is gone, stopping input: {:?}", e);
            break;
        }
    }
}
