use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use relay_agent::{
    AgentConfig, AgentRuntime, ExecOutcome, ExecRequest, FeatureAllowlist, NoopChannel,
    NoopEventEmitter, RunSummary,
};
use relay_llm::Client;
use relay_store::{FsStore, ProviderState};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "RELAY_LOG";
const FOLLOW_LIMIT: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Parser, Debug)]
#[command(name = "relay-cli")]
#[command(about = "Operator CLI for the relay agent runtime")]
struct Cli {
    #[arg(long, default_value = "relay.toml")]
    config: PathBuf,
    #[arg(long, default_value = ".relay")]
    state_dir: PathBuf,
    #[arg(long, value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Mark runs left in flight by a previous process as interrupted.
    Recover,
    Runs(RunsArgs),
    #[command(subcommand)]
    Providers(ProvidersCommand),
    Exec(ExecArgs),
}

#[derive(clap::Args, Debug)]
struct RunsArgs {
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum ProvidersCommand {
    Status,
    Enable { provider: String },
    Disable { provider: String },
    /// Clear an automatic disable left by an auth or billing failure.
    Clear { provider: String },
}

#[derive(clap::Args, Debug)]
struct ExecArgs {
    command: String,
    #[arg(long)]
    yield_ms: Option<u64>,
    #[arg(long, action = ArgAction::SetTrue)]
    background: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_logging(cli.log_format);

    let result = match build_runtime(&cli) {
        Ok(runtime) => {
            let result = match cli.command {
                Commands::Recover => recover_command(&runtime).await,
                Commands::Runs(args) => runs_command(&runtime, args).await,
                Commands::Providers(command) => providers_command(&runtime, command).await,
                Commands::Exec(args) => exec_command(&runtime, args).await,
            };
            runtime.shutdown().await;
            result
        }
        Err(error) => Err(error),
    };

    match result {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::from(1)
        }
    }
}

fn init_logging(format: LogFormat) {
    let filter = std::env::var(LOG_ENV)
        .ok()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Pretty => builder.pretty().init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn build_runtime(cli: &Cli) -> Result<AgentRuntime, String> {
    let config = AgentConfig::load(&cli.config).map_err(|error| error.to_string())?;
    let store = Arc::new(FsStore::new(&cli.state_dir).map_err(|error| error.to_string())?);
    let allowlist = Arc::new(FeatureAllowlist::from_config(&config.exec));
    tracing::debug!(
        config = %cli.config.display(),
        state_dir = %cli.state_dir.display(),
        "building runtime"
    );
    AgentRuntime::new(
        config,
        Client::default(),
        store.clone(),
        store,
        Arc::new(NoopChannel),
        allowlist,
        Arc::new(NoopEventEmitter),
    )
    .map_err(|error| error.to_string())
}

async fn recover_command(runtime: &AgentRuntime) -> Result<ExitCode, String> {
    let report = runtime.startup().await.map_err(|error| error.to_string())?;
    println!("interrupted_runs: {}", report.interrupted_runs.len());
    for run_id in &report.interrupted_runs {
        println!("  {run_id}");
    }
    Ok(ExitCode::SUCCESS)
}

async fn runs_command(runtime: &AgentRuntime, args: RunsArgs) -> Result<ExitCode, String> {
    let runs = runtime
        .subagents()
        .list(None)
        .await
        .map_err(|error| error.to_string())?;
    if args.json {
        let json = serde_json::to_string_pretty(&runs).map_err(|e| e.to_string())?;
        println!("{json}");
    } else if runs.is_empty() {
        println!("no subagent runs");
    } else {
        for run in &runs {
            print_run(run);
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn print_run(run: &RunSummary) {
    println!(
        "{}\t{}\t{}\t{}",
        run.run_id,
        run.status,
        run.label.as_deref().unwrap_or("-"),
        run.task
    );
}

async fn providers_command(
    runtime: &AgentRuntime,
    command: ProvidersCommand,
) -> Result<ExitCode, String> {
    let providers = runtime.providers();
    providers.load().await.map_err(|error| error.to_string())?;
    match command {
        ProvidersCommand::Status => {
            for state in providers.snapshot() {
                print_provider(&state);
            }
        }
        ProvidersCommand::Enable { provider } => {
            let state = providers
                .set_enabled(&provider, true)
                .await
                .map_err(|error| error.to_string())?;
            print_provider(&state);
        }
        ProvidersCommand::Disable { provider } => {
            let state = providers
                .set_enabled(&provider, false)
                .await
                .map_err(|error| error.to_string())?;
            print_provider(&state);
        }
        ProvidersCommand::Clear { provider } => {
            let state = providers
                .clear_auto_disable(&provider)
                .await
                .map_err(|error| error.to_string())?;
            print_provider(&state);
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn print_provider(state: &ProviderState) {
    let status = if state.is_eligible() {
        "eligible"
    } else if !state.enabled {
        "disabled"
    } else {
        "auto_disabled"
    };
    println!(
        "{}\t{}\t{}",
        state.provider_id,
        status,
        state.disabled_reason.as_deref().unwrap_or("-")
    );
}

/// Background sessions do not outlive the CLI process; a running session is
/// followed to completion unless `--background` was given.
async fn exec_command(runtime: &AgentRuntime, args: ExecArgs) -> Result<ExitCode, String> {
    let exec = runtime.exec();
    let outcome = exec
        .exec(ExecRequest {
            background: args.background,
            yield_ms: args.yield_ms,
            ..ExecRequest::new(args.command)
        })
        .await
        .map_err(|error| error.to_string())?;

    match outcome {
        ExecOutcome::Done { output, exit_code } => {
            print!("{output}");
            Ok(exit_code_for(exit_code))
        }
        ExecOutcome::Running { session_id } if args.background => {
            println!("session_id: {session_id}");
            Ok(ExitCode::SUCCESS)
        }
        ExecOutcome::Running { session_id } => {
            tracing::info!(session_id = %session_id, "command still running, following output");
            exec.wait_for_terminal(&session_id, FOLLOW_LIMIT)
                .await
                .map_err(|error| error.to_string())?;
            let log = exec
                .log(&session_id, Some(0), None)
                .map_err(|error| error.to_string())?;
            print!("{}", log.content);
            let poll = exec.poll(&session_id).map_err(|error| error.to_string())?;
            Ok(exit_code_for(poll.exit_code))
        }
    }
}

fn exit_code_for(code: Option<i32>) -> ExitCode {
    match code {
        Some(0) => ExitCode::SUCCESS,
        Some(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        None => ExitCode::from(2),
    }
}
