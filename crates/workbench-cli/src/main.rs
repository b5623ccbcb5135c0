mod printer;
mod repl;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;

use workbench_core::{ConversationPersistence, JsonFileStore, Scope, WorkbenchConfig};
use workbench_llm::HttpCompletionService;
use workbench_session::{ConversationSession, SessionConfig};

#[derive(Parser)]
#[command(name = "workbench")]
#[command(about = "Branched chat over a streaming completion service")]
#[command(version)]
struct Cli {
    /// Conversation scope: default, module:<id> or doc:<id>
    #[arg(long, default_value = "default")]
    scope: String,

    /// Completion service base URL
    #[arg(long, env = "WORKBENCH_API_BASE")]
    api_base: Option<String>,

    /// Directory holding conversation records
    #[arg(long, env = "WORKBENCH_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Ask the service to evaluate answers
    #[arg(long)]
    evaluation: bool,

    /// Grounding text sent with every request
    #[arg(long)]
    context: Option<String>,

    /// Enable debug logging
    #[arg(long, short, default_value = "false")]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start interactive chat
    Chat,
    /// Send a single message
    Send {
        /// Message content
        message: String,
    },
    /// Print the stored conversation
    Show,
    /// List scopes with a stored conversation
    Scopes,
    /// Migrate a legacy record and print the result
    Migrate,
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .init();
}

fn resolve_config(cli: &Cli) -> WorkbenchConfig {
    let mut config = WorkbenchConfig::load();
    if let Some(api_base) = &cli.api_base {
        config.api_base = api_base.clone();
    }
    if let Some(data_dir) = &cli.data_dir {
        config.data_dir = Some(data_dir.clone());
    }
    if cli.evaluation {
        config.enable_evaluation = true;
    }
    config
}

async fn open_session(
    config: &WorkbenchConfig,
    scope: Scope,
    context: Option<String>,
) -> anyhow::Result<ConversationSession> {
    let store = JsonFileStore::new(config.data_dir());
    store.init().await?;
    let persistence = ConversationPersistence::new(Arc::new(store));
    let service = Arc::new(HttpCompletionService::from_config(config)?);

    let mut session_config = SessionConfig::from_workbench(config, &scope);
    if let Some(context) = context {
        session_config = session_config.with_context(context);
    }

    let session = ConversationSession::load(scope, persistence, service)
        .await?
        .with_config(session_config)
        .with_observer(Arc::new(printer::StreamPrinter::new()));
    Ok(session)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let config = resolve_config(&cli);
    let scope: Scope = cli.scope.parse()?;
    log::debug!("Using {} with data in {}", config.stream_url(), config.data_dir().display());

    match &cli.command {
        Commands::Chat => {
            let session = open_session(&config, scope, cli.context.clone()).await?;
            repl::run(session).await
        }
        Commands::Send { message } => {
            let mut session = open_session(&config, scope, cli.context.clone()).await?;
            let outcome = session.send_turn(message.clone()).await?;
            printer::print_outcome(&outcome);
            session.flush().await;
            Ok(())
        }
        Commands::Show => {
            let session = open_session(&config, scope, None).await?;
            printer::print_conversation(session.branches());
            Ok(())
        }
        Commands::Scopes => {
            let store = JsonFileStore::new(config.data_dir());
            let persistence = ConversationPersistence::new(Arc::new(store));
            for scope in persistence.list_scopes().await? {
                println!("{}", scope);
            }
            Ok(())
        }
        Commands::Migrate => {
            let store = JsonFileStore::new(config.data_dir());
            let persistence = ConversationPersistence::new(Arc::new(store));
            match persistence.load(&scope).await? {
                Some(conversation) => {
                    println!("{}", serde_json::to_string_pretty(&conversation)?);
                }
                None => println!("{}", format!("Nothing stored for {}", scope).dimmed()),
            }
            Ok(())
        }
    }
}
