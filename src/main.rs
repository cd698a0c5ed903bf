use anyhow::Result;
use clap::Parser;
use serde_json::json;

use crewline::catalog::{run_examples_list, run_examples_show};
use crewline::cli::{
    Cli, Commands, ExampleCommands, ProfileCommands, TelemetryCommands, TranscriptCommands,
    command_label,
};
use crewline::config::{RuntimeConfig, load_profiles, resolve_runtime_config};
use crewline::doctor::run_doctor;
use crewline::error::{categorize_error, format_cli_error, render_error_message};
use crewline::pipeline::{RunRequest, load_catalog, run_workflow};
use crewline::profiles::{run_profiles_list, run_profiles_show};
use crewline::telemetry::{TelemetrySink, run_telemetry_report, unix_ms_now};
use crewline::transcript::run_transcript_ask;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let show_sensitive_config = cli.show_sensitive_config;
    if let Err(err) = run_cli(cli).await {
        eprintln!("{}", format_cli_error(&err, show_sensitive_config));
        tracing::error!(
            category = %categorize_error(&err).code(),
            error = %render_error_message(&err, show_sensitive_config),
            "command failed"
        );
        std::process::exit(1);
    }

    Ok(())
}

async fn run_cli(cli: Cli) -> Result<()> {
    init_tracing(&cli.log_filter)?;
    let profiles = load_profiles(&cli.config_path)?;
    let cfg = resolve_runtime_config(&cli, &profiles)?;

    let Some(command) = cli.command else {
        println!("No command given. Try `crewline examples list` or `crewline --help`.");
        return Ok(());
    };

    let label = command_label(&command);
    let telemetry = TelemetrySink::new(&cfg, label.clone());
    let started = unix_ms_now();
    tracing::debug!(command = label.as_str(), profile = cfg.profile.as_str(), "command started");

    let result = dispatch(command, &cfg, &profiles, &telemetry).await;
    let duration_ms = unix_ms_now().saturating_sub(started);
    match &result {
        Ok(()) => telemetry.emit(
            "command.completed",
            json!({ "duration_ms": duration_ms }),
        ),
        Err(err) => telemetry.emit(
            "command.failed",
            json!({
                "duration_ms": duration_ms,
                "error_kind": categorize_error(err).code(),
                "error": render_error_message(err, cfg.show_sensitive_config),
            }),
        ),
    }
    result
}

async fn dispatch(
    command: Commands,
    cfg: &RuntimeConfig,
    profiles: &crewline::config::ProfilesFile,
    telemetry: &TelemetrySink,
) -> Result<()> {
    match command {
        Commands::Examples { command } => {
            let catalog = load_catalog(cfg)?;
            match command {
                ExampleCommands::List => run_examples_list(&catalog)?,
                ExampleCommands::Show { name } => {
                    run_examples_show(&catalog, &cfg.role_capability_map(), &name)?
                }
            }
        }
        Commands::Run {
            example,
            inputs,
            memory,
            show_task_outputs,
        } => {
            run_workflow(
                cfg,
                RunRequest {
                    example: &example,
                    inputs: &inputs,
                    memory,
                    show_task_outputs,
                },
                telemetry,
            )
            .await?;
        }
        Commands::Doctor => run_doctor(cfg)?,
        Commands::Profiles { command } => match command {
            ProfileCommands::List => run_profiles_list(profiles, cfg)?,
            ProfileCommands::Show => run_profiles_show(cfg)?,
        },
        Commands::Telemetry { command } => match command {
            TelemetryCommands::Report { path, limit } => run_telemetry_report(cfg, path, limit)?,
        },
        Commands::Transcript { command } => match command {
            TranscriptCommands::Ask {
                file,
                features,
                question,
            } => run_transcript_ask(cfg, &file, &question.join(" "), &features).await?,
        },
    }
    Ok(())
}

fn init_tracing(log_filter: &str) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing subscriber: {e}"))
}
