use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;

use crate::memory::RecallStrategyKind;
use crate::transcript::TranscriptFeature;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Auto,
    Openai,
    Deepseek,
    Groq,
    Ollama,
}

#[derive(Debug, Subcommand)]
pub enum ExampleCommands {
    #[command(about = "List workflows from the built-in and configured catalogs")]
    List,
    #[command(about = "Show roles, tasks, bindings, and capabilities of a workflow")]
    Show {
        #[arg(long)]
        name: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum ProfileCommands {
    #[command(about = "List configured profiles and highlight the active profile")]
    List,
    #[command(about = "Show the active profile's resolved runtime settings")]
    Show,
}

#[derive(Debug, Subcommand)]
pub enum TelemetryCommands {
    #[command(about = "Summarize telemetry events from a JSONL stream")]
    Report {
        #[arg(long)]
        path: Option<String>,
        #[arg(long, default_value_t = 5000)]
        limit: usize,
    },
}

#[derive(Debug, Subcommand)]
pub enum TranscriptCommands {
    #[command(about = "Ask a question about a transcript JSON file")]
    Ask {
        #[arg(long)]
        file: String,
        #[arg(long = "feature", value_enum)]
        features: Vec<TranscriptFeature>,
        #[arg(required = true)]
        question: Vec<String>,
    },
}

const CLI_EXAMPLES: &str = "Examples:\n\
  crewline examples list\n\
  crewline examples show --name \"Marketing Campaign\"\n\
  crewline run --example \"Marketing Campaign\" \\\n\
    --input \"Generate Marketing Plan=Spring launch of trail shoes\" \\\n\
    --input \"Research Target Audience=Weekend hikers in the Pacific Northwest\" \\\n\
    --input \"Write Ad Copy=Three short social ads\" \\\n\
    --input \"Create Campaign Schedule=Six weeks starting in April\"\n\
  crewline --provider ollama --model llama3.1 run --example \"Marketing Campaign\" --memory --input ...\n\
  crewline --mandatory-capability web_search run --example \"Marketing Campaign\" --input ...\n\
  crewline transcript ask --file call.json --feature sentiment \"What did the customer object to?\"\n\
  crewline telemetry report --limit 2000\n\
  crewline doctor\n\
\n\
Capabilities:\n\
  web_search needs SERPER_API_KEY. Roles whose capabilities cannot be built run without them\n\
  unless the capability is listed with --mandatory-capability.";

#[derive(Debug, Parser)]
#[command(name = "crewline")]
#[command(about = "Run role-based LLM worker crews over catalog workflows")]
#[command(after_long_help = CLI_EXAMPLES)]
pub struct Cli {
    #[arg(long, env = "CREWLINE_PROVIDER", value_enum, default_value_t = Provider::Auto)]
    pub provider: Provider,

    #[arg(long, env = "CREWLINE_MODEL")]
    pub model: Option<String>,

    #[arg(long, env = "CREWLINE_API_BASE")]
    pub api_base: Option<String>,

    #[arg(long, env = "CREWLINE_PROFILE", default_value = "default")]
    pub profile: String,

    #[arg(long, env = "CREWLINE_CONFIG", default_value = ".crewline/config.toml")]
    pub config_path: String,

    #[arg(long, env = "CREWLINE_CATALOG")]
    pub catalog_path: Option<String>,

    #[arg(long, env = "CREWLINE_WORKSPACE")]
    pub workspace_root: Option<String>,

    #[arg(long, env = "CREWLINE_TASK_TIMEOUT_SECS")]
    pub task_timeout_secs: Option<u64>,

    #[arg(long, env = "CREWLINE_MAX_TOOL_ROUNDS")]
    pub max_tool_rounds: Option<usize>,

    #[arg(long, env = "CREWLINE_MAX_RETRIES")]
    pub max_retries: Option<usize>,

    #[arg(long, env = "CREWLINE_GOAL_TEMPLATE")]
    pub goal_template: Option<String>,

    #[arg(long, env = "CREWLINE_MEMORY_STRATEGY", value_enum)]
    pub memory_strategy: Option<RecallStrategyKind>,

    #[arg(long, env = "CREWLINE_MEMORY_WINDOW")]
    pub memory_window: Option<usize>,

    #[arg(long, env = "CREWLINE_MEMORY_STORE")]
    pub memory_store_path: Option<String>,

    #[arg(long, env = "CREWLINE_MEMORY_MAX_ENTRIES")]
    pub memory_max_entries: Option<usize>,

    #[arg(long = "mandatory-capability", env = "CREWLINE_MANDATORY_CAPABILITY")]
    pub mandatory_capability: Vec<String>,

    #[arg(long = "allow-capability", env = "CREWLINE_ALLOW_CAPABILITY")]
    pub allow_capability: Vec<String>,

    #[arg(long = "deny-capability", env = "CREWLINE_DENY_CAPABILITY")]
    pub deny_capability: Vec<String>,

    #[arg(long, env = "CREWLINE_SHOW_SENSITIVE_CONFIG", default_value_t = false)]
    pub show_sensitive_config: bool,

    #[arg(long, env = "CREWLINE_TELEMETRY_ENABLED", action = clap::ArgAction::Set)]
    pub telemetry_enabled: Option<bool>,

    #[arg(long, env = "CREWLINE_TELEMETRY_PATH")]
    pub telemetry_path: Option<String>,

    #[arg(long, env = "RUST_LOG", default_value = "error")]
    pub log_filter: String,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(about = "Browse the workflow catalog")]
    Examples {
        #[command(subcommand)]
        command: ExampleCommands,
    },
    #[command(about = "Run a catalog workflow with one input per task")]
    Run {
        #[arg(long)]
        example: String,
        #[arg(long = "input", value_name = "TASK=TEXT")]
        inputs: Vec<String>,
        #[arg(long, default_value_t = false)]
        memory: bool,
        #[arg(long, default_value_t = false)]
        show_task_outputs: bool,
    },
    #[command(about = "Validate provider environment, credentials, and catalog configuration")]
    Doctor,
    #[command(about = "Inspect profile configuration and active resolved profile state")]
    Profiles {
        #[command(subcommand)]
        command: ProfileCommands,
    },
    #[command(about = "Telemetry utilities and reporting")]
    Telemetry {
        #[command(subcommand)]
        command: TelemetryCommands,
    },
    #[command(about = "Chat about a transcript")]
    Transcript {
        #[command(subcommand)]
        command: TranscriptCommands,
    },
}

pub fn command_label(command: &Commands) -> String {
    match command {
        Commands::Examples { command } => match command {
            ExampleCommands::List => "examples.list".to_string(),
            ExampleCommands::Show { .. } => "examples.show".to_string(),
        },
        Commands::Run { .. } => "run".to_string(),
        Commands::Doctor => "doctor".to_string(),
        Commands::Profiles { command } => match command {
            ProfileCommands::List => "profiles.list".to_string(),
            ProfileCommands::Show => "profiles.show".to_string(),
        },
        Commands::Telemetry { command } => match command {
            TelemetryCommands::Report { .. } => "telemetry.report".to_string(),
        },
        Commands::Transcript { command } => match command {
            TranscriptCommands::Ask { .. } => "transcript.ask".to_string(),
        },
    }
}
