// Pipeline Template CLI
// Expands, evaluates and validates templated YAML pipelines

mod commands;
mod output;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tracing_subscriber::EnvFilter;

/// Expand and validate templated YAML pipelines
#[derive(Parser, Debug)]
#[command(name = "pipeline-template", version, about, long_about = None)]
struct Cli {
    /// Enable debug logging (overridden by PIPELINE_TEMPLATE_LOG or RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Expand a template document and print the result
    Expand(commands::expand::ExpandArgs),
    /// Evaluate a single expression
    Eval(commands::eval::EvalArgs),
    /// Expand a template document and report diagnostics only
    Validate(commands::validate::ValidateArgs),
    /// Load a schema file and list its definitions
    Schema(commands::schema::SchemaArgs),
}

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Expand(args) => commands::expand::execute(args),
        Command::Eval(args) => commands::eval::execute(args),
        Command::Validate(args) => commands::validate::execute(args),
        Command::Schema(args) => commands::schema::execute(args),
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = std::env::var("PIPELINE_TEMPLATE_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .map(EnvFilter::new)
        .unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
