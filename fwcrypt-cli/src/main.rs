// CLI application
use clap::Parser;
use fwcrypt_core::config::{config_path, EngineConfig};
use fwcrypt_web::security::Scope;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;

mod commands;

#[derive(Parser)]
#[command(name = "fwcrypt")]
#[command(about = "Firmware cryptographic primitive and protocol analysis")]
#[command(version)]
struct Cli {
    /// Engine configuration file (defaults to $FWCRYPT_CONFIG)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum KeyScope {
    ReadReports,
    SubmitJobs,
}

impl From<KeyScope> for Scope {
    fn from(scope: KeyScope) -> Self {
        match scope {
            KeyScope::ReadReports => Scope::ReadReports,
            KeyScope::SubmitJobs => Scope::SubmitJobs,
        }
    }
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Analyze a firmware image
    Analyze {
        /// Path to the firmware image (ELF, Intel HEX or raw)
        file: PathBuf,

        /// Print the full report as JSON
        #[arg(long)]
        json: bool,

        /// Also write the full report to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Show container format, sections and architecture candidates
    Arch {
        /// Path to the firmware image
        file: PathBuf,
    },
    /// Validate and print a compliance ruleset
    Rules {
        /// Ruleset file (defaults to the configured or embedded ruleset)
        #[arg(short, long)]
        ruleset: Option<PathBuf>,

        /// Write the ruleset as JSON to this file
        #[arg(long)]
        export: Option<PathBuf>,
    },
    /// Hash a bearer token into an API key configuration entry
    HashKey {
        /// Plaintext bearer token
        token: String,

        #[arg(long, default_value = "default")]
        id: String,

        #[arg(long, default_value = "API key")]
        name: String,

        /// Granted scopes
        #[arg(long = "scope", value_enum, default_values_t = [KeyScope::ReadReports])]
        scopes: Vec<KeyScope>,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config = EngineConfig::load_or_default(config_path(cli.config.as_deref()).as_deref())?;

    match cli.command {
        Commands::Analyze { file, json, output } => {
            let pb = create_progress_bar(&format!("Analyzing {}...", file.display()));
            let report = match commands::analyze_file(&file, &config) {
                Ok(report) => report,
                Err(err) => {
                    pb.finish_and_clear();
                    return Err(err);
                }
            };
            pb.finish_and_clear();

            if json {
                println!("{}", serde_json::to_string_pretty(report.as_ref())?);
            } else {
                commands::print_report(&report);
            }
            if let Some(output) = output {
                commands::write_report(&report, &output)?;
            }
        }
        Commands::Arch { file } => {
            commands::probe_architecture(&file, &config)?;
        }
        Commands::Rules { ruleset, export } => {
            let path = ruleset.or_else(|| config.ruleset_path.clone());
            commands::show_ruleset(path.as_deref(), export.as_deref())?;
        }
        Commands::HashKey {
            token,
            id,
            name,
            scopes,
        } => {
            let scopes: Vec<Scope> = scopes.into_iter().map(Scope::from).collect();
            println!("{}", commands::api_key_entry(&token, &id, &name, scopes)?);
        }
    }

    Ok(())
}

fn create_progress_bar(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::default_spinner()
        .template("{spinner:.green} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
    pb.set_style(style);
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}
