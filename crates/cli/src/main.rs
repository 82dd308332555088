//! reposcope command-line tool.
//!
//! Starts the configured backend, drives long-running source-control
//! operations through it and walks the user through merge conflicts:
//! list them, resolve files, continue or abort. Also manages stable
//! locations.

mod display;
mod style;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::Confirm;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use reposcope_core::config::{AppConfig, LoggingConfig};
use reposcope_core::models::{ConflictState, OperationId};
use reposcope_core::protocol::{MessageKind, Outcome, ServerMessage};
use reposcope_core::stable::remote_bookmark_entries;
use reposcope_core::Session;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// reposcope command-line tool.
#[derive(Parser, Debug)]
#[command(
    name = "reposcope",
    version,
    about = "Run source-control operations and resolve their merge conflicts"
)]
struct Cli {
    /// Path to the TOML configuration file
    /// [default: <config dir>/reposcope/config.toml].
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a default configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate a configuration file.
    Validate,

    /// Show the merge conflicts of the current operation.
    Conflicts {
        /// Print the conflict set as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Start an operation, e.g. `reposcope run rebase -- -d main`.
    Run {
        /// Operation kind, e.g. `rebase` or `amend`.
        kind: String,

        /// Arguments passed through to the operation.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Mark a conflicted file as resolved.
    Resolve {
        /// Repo-relative path of the file.
        path: String,

        /// Merge tool to resolve with.
        #[arg(short, long, default_value = "internal:merge")]
        tool: String,
    },

    /// Continue the interrupted operation once every file is resolved.
    Continue,

    /// Abort the interrupted operation.
    Abort {
        /// Do not ask for confirmation.
        #[arg(short, long)]
        yes: bool,
    },

    /// Manage stable locations.
    Stables {
        #[command(subcommand)]
        action: StablesAction,
    },
}

#[derive(Subcommand, Debug)]
enum StablesAction {
    /// List special and manual stable locations.
    List,
    /// Track a custom stable location.
    Add {
        /// Name of the location.
        name: String,
    },
    /// Stop tracking a custom stable location.
    Remove {
        /// Name of the location.
        name: String,
    },
    /// List remote bookmarks.
    Remote,
    /// Search the locations that can be added.
    Search {
        /// Case-insensitive substring of the value or label.
        #[arg(default_value = "")]
        query: String,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", style::error(&format!("{:#}", e)));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let explicit = cli.config.is_some();
    let config_path = match cli.config {
        Some(path) => path,
        None => default_config_path()?,
    };

    match cli.command {
        Commands::Init { output } => {
            init_logging(&LoggingConfig::default())?;
            cmd_init(output.as_deref().unwrap_or(&config_path))
        }
        Commands::Validate => {
            init_logging(&LoggingConfig::default())?;
            cmd_validate(&config_path)
        }
        command => {
            let config = load_config(&config_path, explicit)?;
            let _guard = init_logging(&config.logging)?;
            let session =
                Session::spawn_backend(&config).context("failed to start the backend")?;

            let result = dispatch(&session, command).await;
            if let Err(e) = session.shutdown().await {
                warn!(error = %e, "backend did not shut down cleanly");
            }
            result
        }
    }
}

async fn dispatch(session: &Session, command: Commands) -> Result<()> {
    match command {
        Commands::Conflicts { json } => cmd_conflicts(session, json).await,
        Commands::Run { kind, args } => cmd_run(session, kind, args).await,
        Commands::Resolve { path, tool } => cmd_resolve(session, &path, &tool).await,
        Commands::Continue => cmd_continue(session).await,
        Commands::Abort { yes } => cmd_abort(session, yes).await,
        Commands::Stables { action } => cmd_stables(session, action).await,
        Commands::Init { .. } | Commands::Validate => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Config & logging helpers
// ---------------------------------------------------------------------------

fn default_config_path() -> Result<PathBuf> {
    let dir = dirs::config_dir().context("could not determine the user config directory")?;
    Ok(dir.join("reposcope").join("config.toml"))
}

/// Load the config file. A missing file at the default location means
/// built-in defaults; a missing file given with `--config` is an error.
fn load_config(path: &Path, explicit: bool) -> Result<AppConfig> {
    if !explicit && !path.exists() {
        let mut config = AppConfig::default();
        config.apply_env_overrides();
        config.validate().context("invalid default configuration")?;
        return Ok(config);
    }
    AppConfig::load_and_resolve(path).context("failed to load configuration file")
}

/// Initialise tracing. `RUST_LOG` wins over the configured level. The
/// returned guard must live until exit so file logs are flushed.
fn init_logging(logging: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time();

    let (file_layer, guard) = match &logging.file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
            let name = path
                .file_name()
                .context("logging.file must name a file")?;
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("failed to initialise logging")?;
    Ok(guard)
}

/// Run `fut` with a spinner, failing after the session's request timeout.
async fn with_timeout<T, F>(session: &Session, msg: &str, fut: F) -> Result<T>
where
    F: Future<Output = T>,
{
    let spinner = style::spinner(msg);
    let result = tokio::time::timeout(session.request_timeout(), fut).await;
    spinner.finish_and_clear();
    result.with_context(|| {
        format!(
            "backend did not answer within {}s",
            session.request_timeout().as_secs()
        )
    })
}

// ---------------------------------------------------------------------------
// Operation steps
// ---------------------------------------------------------------------------

/// How a step of an operation ended.
#[derive(Debug)]
enum Step {
    Concluded {
        outcome: Outcome,
        error: Option<String>,
    },
    Conflicts,
    Rejected(String),
}

/// Wait for the next event that ends a step of `id`.
async fn next_step(
    events: &mut broadcast::Receiver<ServerMessage>,
    id: &OperationId,
) -> Result<Step> {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event stream lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => {
                anyhow::bail!("backend disconnected");
            }
        };
        if event.operation_id() != Some(id) {
            continue;
        }
        match event {
            ServerMessage::OperationConcluded { outcome, error, .. } => {
                return Ok(Step::Concluded { outcome, error })
            }
            ServerMessage::ConflictsStarted { paths, .. } if !paths.is_empty() => {
                return Ok(Step::Conflicts)
            }
            ServerMessage::CommandFailed { error, .. } => return Ok(Step::Rejected(error)),
            other => debug!(kind = ?other.kind(), "waiting for operation step"),
        }
    }
}

fn report_step(session: &Session, step: Step) -> Result<()> {
    match step {
        Step::Concluded {
            outcome: Outcome::Success,
            ..
        } => {
            println!("{}", style::success("Operation completed"));
            Ok(())
        }
        Step::Concluded { error, .. } if session.orchestrator().is_in_conflict() => {
            if let Some(error) = error {
                println!("{}", style::dim(&error));
            }
            print_conflicts(session);
            Ok(())
        }
        Step::Concluded { error, .. } => {
            anyhow::bail!("operation failed: {}", error.unwrap_or_else(|| "unknown error".into()))
        }
        Step::Conflicts => {
            print_conflicts(session);
            Ok(())
        }
        Step::Rejected(error) => anyhow::bail!("backend rejected the command: {}", error),
    }
}

fn print_conflicts(session: &Session) {
    let orchestrator = session.orchestrator();
    println!();
    match orchestrator.conflicts() {
        Some(set) => {
            println!(
                "{}",
                style::header(&format!(
                    "Merge conflicts (round {}, {} unresolved)",
                    set.round,
                    set.unresolved_count()
                ))
            );
            println!();
            println!("{}", display::conflicts_table(&set));
            if let Some(failure) = &set.failure {
                println!("{}", style::warn(failure));
            }
        }
        None => println!("{}", style::success("No active conflicts")),
    }
    println!();
    println!("{}", style::state(orchestrator.state()));
    match orchestrator.state() {
        ConflictState::InConflict => {
            println!("Next: resolve files with 'reposcope resolve <path>'");
        }
        ConflictState::Resolvable => println!("Next: run 'reposcope continue'"),
        ConflictState::Idle => {}
    }
    println!();
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

fn cmd_init(output: &Path) -> Result<()> {
    if output.exists() {
        let overwrite = Confirm::new()
            .with_prompt(format!("{} already exists. Overwrite?", output.display()))
            .default(false)
            .interact()
            .context("failed to read confirmation")?;
        if !overwrite {
            println!(
                "{}",
                style::warn("Init cancelled. Existing file was not modified.")
            );
            return Ok(());
        }
    }

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(output, AppConfig::template()).context("failed to write config file")?;

    println!(
        "{}",
        style::success(&format!("Default configuration written to {}", output.display()))
    );
    println!();
    println!("Next steps:");
    println!("  1. Point [backend] command at your source-control server");
    println!(
        "  2. Validate with: reposcope validate --config {}",
        output.display()
    );
    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let mut config =
        AppConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  [OK] TOML structure is valid");

    config.apply_env_overrides();
    println!("  [OK] Environment overrides processed");

    match config.validate() {
        Ok(()) => println!("  [OK] All required fields are valid"),
        Err(e) => {
            println!("  [FAIL] Validation error: {}", e);
            anyhow::bail!("configuration validation failed");
        }
    }

    println!();
    println!("Configuration summary:");
    println!("  Backend       : {}", config.backend.command);
    if !config.backend.args.is_empty() {
        println!("  Backend args  : {}", config.backend.args.join(" "));
    }
    println!(
        "  Working dir   : {}",
        config
            .backend
            .working_dir
            .as_ref()
            .map(|d| d.display().to_string())
            .unwrap_or_else(|| "(current directory)".into())
    );
    println!("  Timeout       : {}s", config.session.request_timeout_secs);
    println!("  Log level     : {}", config.logging.level);
    if let Some(file) = &config.logging.file {
        println!("  Log file      : {}", file.display());
    }
    Ok(())
}

async fn cmd_conflicts(session: &Session, json: bool) -> Result<()> {
    let set = with_timeout(session, "Fetching conflicts...", session.refresh_conflicts())
        .await?
        .context("backend disconnected")?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&set).context("failed to encode conflicts")?
        );
        return Ok(());
    }
    print_conflicts(session);
    Ok(())
}

async fn cmd_run(session: &Session, kind: String, args: Vec<String>) -> Result<()> {
    let mut events = session.subscribe();
    let label = if args.is_empty() {
        kind.clone()
    } else {
        format!("{} {}", kind, args.join(" "))
    };
    let id = session.orchestrator().run_operation(kind, args);
    debug!(%id, "operation requested");

    let step = with_timeout(session, &format!("Running {}...", label), next_step(&mut events, &id))
        .await??;
    report_step(session, step)
}

/// Load the backend's view of the conflicts before acting on them.
async fn load_conflicts(session: &Session) -> Result<()> {
    with_timeout(session, "Fetching conflicts...", session.refresh_conflicts())
        .await?
        .context("backend disconnected")?;
    if !session.orchestrator().is_in_conflict() {
        anyhow::bail!("no operation is in conflict");
    }
    Ok(())
}

async fn cmd_resolve(session: &Session, path: &str, tool: &str) -> Result<()> {
    load_conflicts(session).await?;

    let confirmation = session
        .channel()
        .await_next(MessageKind::ConflictStatus);
    session
        .orchestrator()
        .resolve(path, tool)
        .with_context(|| format!("cannot resolve {}", path))?;

    with_timeout(session, &format!("Resolving {}...", path), confirmation)
        .await?
        .context("backend disconnected")?;

    let set = session.conflicts();
    let file = set.as_ref().and_then(|s| s.file(path));
    match file {
        Some(file) if file.status.is_settled() => {
            println!("{}", style::success(&format!("{} resolved with {}", path, tool)));
        }
        Some(_) => {
            let reason = set
                .as_ref()
                .and_then(|s| s.failure.clone())
                .unwrap_or_else(|| "backend kept the file unresolved".into());
            anyhow::bail!("could not resolve {}: {}", path, reason);
        }
        None => println!("{}", style::success(&format!("{} resolved with {}", path, tool))),
    }
    print_conflicts(session);
    Ok(())
}

async fn cmd_continue(session: &Session) -> Result<()> {
    load_conflicts(session).await?;

    let mut events = session.subscribe();
    let id = session
        .orchestrator()
        .continue_operation()
        .context("cannot continue")?;
    let step = with_timeout(session, "Continuing...", next_step(&mut events, &id)).await??;
    report_step(session, step)
}

async fn cmd_abort(session: &Session, yes: bool) -> Result<()> {
    load_conflicts(session).await?;

    if !yes {
        let confirmed = Confirm::new()
            .with_prompt("Abort the operation and discard conflict resolutions?")
            .default(false)
            .interact()
            .context("failed to read confirmation")?;
        if !confirmed {
            println!("{}", style::warn("Abort cancelled."));
            return Ok(());
        }
    }

    with_timeout(session, "Aborting...", session.orchestrator().abort())
        .await?
        .context("abort failed; conflicts are unchanged")?;
    println!("{}", style::success("Operation aborted"));
    Ok(())
}

async fn cmd_stables(session: &Session, action: StablesAction) -> Result<()> {
    let stables = session.stables();
    match action {
        StablesAction::List => {
            // Best effort: without a latest commit no staleness warnings are shown.
            match tokio::time::timeout(session.request_timeout(), stables.fetch_latest_public())
                .await
            {
                Ok(Ok(commit)) => debug!(hash = %commit.hash, "latest public commit"),
                Ok(Err(e)) => debug!(error = %e, "latest public commit unavailable"),
                Err(_) => debug!("latest public commit request timed out"),
            }

            let data = with_timeout(session, "Fetching stable locations...", stables.fetch())
                .await?
                .context("failed to fetch stable locations")?;
            let entries = stables.entries(&data);

            println!();
            println!("{}", style::header("Stable Locations"));
            println!(
                "{}",
                style::dim("Commits with successful builds and warmed-up caches")
            );
            println!();
            if entries.is_empty() {
                println!("{}", style::dim("No stable locations"));
            } else {
                println!("{}", display::stables_table(&entries));
            }
            if data.repo_supports_custom_stables {
                println!();
                println!("Add your own with 'reposcope stables add <name>'");
            }
            println!();
        }
        StablesAction::Add { name } => {
            let name = stables.add_manual(&name)?;
            // The backend answers in order, so the refetch reflects the add.
            let data = with_timeout(session, "Adding stable location...", stables.refresh())
                .await?
                .context("failed to confirm the new stable location")?;
            if !data.manual.contains_key(&name) {
                anyhow::bail!("backend did not add stable location {}", name);
            }
            println!("{}", style::success(&format!("Added stable location {}", name)));
        }
        StablesAction::Remove { name } => {
            let name = stables.remove_manual(&name)?;
            let data = with_timeout(session, "Removing stable location...", stables.refresh())
                .await?
                .context("failed to confirm the removal")?;
            if data.manual.contains_key(&name) {
                anyhow::bail!("backend still tracks stable location {}", name);
            }
            println!("{}", style::success(&format!("Removed stable location {}", name)));
        }
        StablesAction::Remote => {
            let names = with_timeout(session, "Fetching remote bookmarks...", stables.remote_bookmarks())
                .await?
                .context("failed to fetch remote bookmarks")?;
            let entries = remote_bookmark_entries(&names);
            println!();
            println!("{}", style::header("Remote Bookmarks"));
            println!();
            if entries.is_empty() {
                println!("{}", style::dim("No remote bookmarks"));
            } else {
                println!("{}", display::stables_table(&entries));
            }
            println!();
        }
        StablesAction::Search { query } => {
            let options = with_timeout(session, "Searching...", stables.autocomplete(&query))
                .await?
                .context("failed to fetch stable location options")?;
            if options.is_empty() {
                println!("{}", style::dim("No matching locations"));
            }
            for option in options {
                match option.detail {
                    Some(detail) => println!("{}  {}  {}", option.value, option.label, style::dim(&detail)),
                    None => println!("{}  {}", option.value, option.label),
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reposcope_core::models::StableLocationData;
    use reposcope_core::protocol::ClientMessage;

    #[test]
    fn test_cli_parses_run_with_trailing_args() {
        let cli = Cli::try_parse_from(["reposcope", "run", "rebase", "-d", "main"]).unwrap();
        match cli.command {
            Commands::Run { kind, args } => {
                assert_eq!(kind, "rebase");
                assert_eq!(args, vec!["-d", "main"]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_cli_parses_stables_add() {
        let cli = Cli::try_parse_from(["reposcope", "--config", "x.toml", "stables", "add", "mine"])
            .unwrap();
        assert_eq!(cli.config.as_deref(), Some(Path::new("x.toml")));
        assert!(matches!(
            cli.command,
            Commands::Stables {
                action: StablesAction::Add { ref name }
            } if name == "mine"
        ));
    }

    #[test]
    fn test_cli_parses_stables_remote() {
        let cli = Cli::try_parse_from(["reposcope", "stables", "remote"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Stables {
                action: StablesAction::Remote
            }
        ));
    }

    #[tokio::test]
    async fn test_stables_add_waits_for_confirming_fetch() {
        let (endpoint, mut backend) = reposcope_core::transport::memory();
        let session = Session::connect(endpoint, &Default::default());

        let backend_side = async {
            assert_eq!(
                backend.next_command().await,
                Some(ClientMessage::AddManualStable { name: "mine".into() })
            );
            assert_eq!(
                backend.next_command().await,
                Some(ClientMessage::FetchStableLocations)
            );
            let mut stables = StableLocationData::default();
            stables.manual.insert("mine".into(), None);
            backend.emit(ServerMessage::FetchedStableLocations { stables });
        };
        let add = cmd_stables(&session, StablesAction::Add { name: " mine ".into() });
        let (result, ()) = tokio::join!(add, backend_side);
        result.unwrap();
    }

    #[tokio::test]
    async fn test_stables_add_fails_when_backend_ignores_it() {
        let (endpoint, mut backend) = reposcope_core::transport::memory();
        let session = Session::connect(endpoint, &Default::default());

        let backend_side = async {
            backend.next_command().await;
            backend.next_command().await;
            backend.emit(ServerMessage::FetchedStableLocations {
                stables: StableLocationData::default(),
            });
        };
        let add = cmd_stables(&session, StablesAction::Add { name: "mine".into() });
        let (result, ()) = tokio::join!(add, backend_side);
        assert!(result.is_err());
    }

    #[test]
    fn test_resolve_default_tool() {
        let cli = Cli::try_parse_from(["reposcope", "resolve", "a.txt"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Resolve { ref tool, .. } if tool == "internal:merge"
        ));
    }

    #[test]
    fn test_load_config_missing_default_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml"), false).unwrap();
        assert_eq!(config.session.request_timeout_secs, 30);
        assert!(load_config(&dir.path().join("absent.toml"), true).is_err());
    }

    #[test]
    fn test_init_writes_loadable_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        cmd_init(&path).unwrap();
        let config = AppConfig::load_and_resolve(&path).unwrap();
        assert_eq!(config.logging.level, "warn");
    }
}
