mod commands;
mod image;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "tribunal-cli")]
#[command(about = "Tribunal CLI - Judge submissions locally and manage the sandbox image", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Judge a source file against a test-case file
    Evaluate {
        /// Source file with the submission
        #[arg(short, long)]
        code: PathBuf,

        /// JSON file with the test cases
        #[arg(short, long)]
        tests: PathBuf,

        #[arg(short, long, default_value = "python")]
        language: String,

        /// Function to call (defaults to solution)
        #[arg(short, long)]
        entry_point: Option<String>,

        /// Per-case time limit
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Run every case instead of stopping at the first failure
        #[arg(long, default_value = "false")]
        all: bool,

        /// Print the raw JSON response
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// Check whether a fix repairs the defect in the original code
    DebugFix {
        /// Original (defective) source file
        #[arg(short, long)]
        original: PathBuf,

        /// Fixed source file
        #[arg(short, long)]
        fix: PathBuf,

        /// JSON file with the test cases
        #[arg(short, long)]
        tests: PathBuf,

        #[arg(short, long, default_value = "python")]
        language: String,

        /// Function the fix must define (defaults to solution)
        #[arg(short, long)]
        entry_point: Option<String>,

        /// Function of the original code to compare against
        #[arg(long)]
        original_entry_point: Option<String>,

        /// Skip the advisory explanation
        #[arg(long, default_value = "false")]
        no_explain: bool,

        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// Render the sandbox image Dockerfile from its template
    RenderDockerfile {
        #[arg(short, long, default_value = "python")]
        language: String,

        /// Where to write the Dockerfile (defaults to dockerfiles/{language}/Dockerfile)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Build the sandbox image for a language
    BuildImage {
        #[arg(short, long, default_value = "python")]
        language: String,

        /// Skip build cache
        #[arg(long, default_value = "false")]
        no_cache: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Diagnostics go to stderr so --json output stays clean
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let success = match cli.command {
        Commands::Evaluate {
            code,
            tests,
            language,
            entry_point,
            timeout_ms,
            all,
            json,
        } => {
            commands::evaluate(commands::EvaluateArgs {
                code: &code,
                tests: &tests,
                language,
                entry_point,
                timeout_ms,
                run_all: all,
                json,
            })
            .await?
        }
        Commands::DebugFix {
            original,
            fix,
            tests,
            language,
            entry_point,
            original_entry_point,
            no_explain,
            json,
        } => {
            commands::debug_fix(commands::DebugFixArgs {
                original: &original,
                fix: &fix,
                tests: &tests,
                language,
                entry_point,
                original_entry_point,
                explain: !no_explain,
                json,
            })
            .await?
        }
        Commands::RenderDockerfile { language, output } => {
            image::render_dockerfile(&language, output.as_deref())?;
            true
        }
        Commands::BuildImage { language, no_cache } => {
            image::build_image(&language, no_cache)?;
            true
        }
    };

    Ok(if success { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
