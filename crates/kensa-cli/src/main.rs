//! KENSA CLI
//!
//! Command-line interface for compiling and running FHIR conformance test plans

mod commands;
mod output;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{Shell, generate};
use kensa_core::{Result, init_tracing};
use std::io;
use std::path::PathBuf;
use tracing::error;

#[derive(Parser)]
#[command(name = "kensa")]
#[command(about = "KENSA: conformance testing for FHIR profile servers")]
#[command(version = kensa_core::VERSION)]
#[command(
    long_about = "KENSA compiles profile metadata into ordered test plans and runs them\n\
against a live FHIR server.\n\
\n\
Examples:\n  \
kensa plan --metadata metadata/              # Show compiled test plans\n  \
kensa run                                    # Run using the discovered config\n  \
kensa run --base-url http://localhost:8080/fhir --patient 85\n  \
kensa config init                            # Create a configuration file"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(
        short,
        long,
        global = true,
        help = "Path to configuration file (.kensarc.json/.kensarc.toml/kensa.yaml)"
    )]
    config: Option<PathBuf>,

    /// Verbose output (can be used multiple times for increased verbosity)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Generate shell completion script
    #[arg(
        long,
        value_enum,
        help = "Generate completion script for specified shell"
    )]
    generate_completion: Option<Shell>,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile profile metadata and print the resulting test plans
    Plan {
        /// Metadata files or directories (overrides config)
        #[arg(short, long, help = "Metadata files or directories")]
        metadata: Vec<PathBuf>,

        /// Only show these profiles (canonical names)
        #[arg(short, long, help = "Only show the named profiles")]
        profile: Vec<String>,

        /// Output format
        #[arg(short, long, default_value = "human", help = "Output format")]
        format: OutputFormat,
    },

    /// Run the compiled test plans against a FHIR server
    Run {
        #[command(flatten)]
        overrides: RunOverrides,

        /// Only run these profiles (canonical names)
        #[arg(short, long, help = "Only run the named profiles")]
        profile: Vec<String>,

        /// Output format
        #[arg(short, long, default_value = "human", help = "Output format")]
        format: OutputFormat,

        /// Also write the JSON report to this file
        #[arg(short, long, help = "Write the JSON report to a file")]
        output: Option<PathBuf>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Print version information
    Version,
}

/// Command-line values that take precedence over the configuration file
#[derive(clap::Args, Debug, Default)]
struct RunOverrides {
    /// FHIR base URL of the server under test
    #[arg(long, help = "FHIR base URL of the server under test")]
    base_url: Option<String>,

    /// Bearer token sent with every request
    #[arg(long, env = "KENSA_BEARER_TOKEN", hide_env_values = true)]
    bearer_token: Option<String>,

    /// Request timeout in seconds
    #[arg(long, help = "Request timeout in seconds")]
    timeout: Option<u64>,

    /// Patient ids to search with
    #[arg(long = "patient", help = "Patient id (can be used multiple times)")]
    patient_ids: Vec<String>,

    /// Metadata files or directories
    #[arg(short, long, help = "Metadata files or directories")]
    metadata: Vec<PathBuf>,

    /// ValueSet directories for binding checks
    #[arg(long = "value-sets", help = "ValueSet directories for binding checks")]
    value_set_directories: Vec<PathBuf>,

    /// Maximum references read by reference resolution tests
    #[arg(long, help = "Maximum references read per reference resolution test")]
    max_references: Option<usize>,

    /// Skip repeating first searches with POST
    #[arg(long, help = "Do not repeat first searches with POST")]
    no_post_search: bool,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Initialize a new configuration file
    Init {
        /// Configuration file format
        #[arg(long, default_value = "json", help = "Configuration file format")]
        format: ConfigFormat,

        /// Overwrite existing configuration file
        #[arg(long, help = "Overwrite existing configuration file")]
        force: bool,
    },

    /// Show current configuration
    Show {
        /// Print the configuration JSON schema instead
        #[arg(long, help = "Print the configuration JSON schema")]
        schema: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum OutputFormat {
    /// Human-readable output with colors
    Human,
    /// JSON format for programmatic consumption
    Json,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ConfigFormat {
    /// JSON configuration format
    Json,
    /// TOML configuration format
    Toml,
    /// YAML configuration format
    Yaml,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle shell completion generation
    if let Some(shell) = cli.generate_completion {
        generate_completion_script(shell);
        return Ok(());
    }

    if !cli.no_color && std::env::var("NO_COLOR").is_err() {
        colored::control::set_override(true);
    } else {
        colored::control::set_override(false);
    }

    // Initialize tracing based on verbosity
    let level = match cli.verbose {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    };
    unsafe {
        std::env::set_var("RUST_LOG", format!("kensa={level},kensa_core={level}"));
    }
    init_tracing();

    match run_command(cli).await {
        Ok(()) => Ok(()),
        Err(e) => {
            error!("kensa failed: {}", e);
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}

fn generate_completion_script(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut io::stdout());
}

async fn run_command(cli: Cli) -> Result<()> {
    match cli.command {
        Some(Commands::Plan {
            metadata,
            profile,
            format,
        }) => commands::plan_command(metadata, profile, format, cli.config),
        Some(Commands::Run {
            overrides,
            profile,
            format,
            output,
        }) => commands::run_command(overrides, profile, format, output, cli.config).await,
        Some(Commands::Config { action }) => match action {
            ConfigAction::Init { format, force } => commands::config::init_command(format, force),
            ConfigAction::Show { schema } => commands::config::show_command(schema, cli.config),
        },
        Some(Commands::Version) => {
            println!("kensa {}", kensa_core::VERSION);
            Ok(())
        }
        None => {
            let mut cmd = Cli::command();
            cmd.print_help()
                .map_err(|e| kensa_core::KensaError::internal_error(e.to_string()))?;
            Ok(())
        }
    }
}
