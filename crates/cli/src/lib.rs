pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "expensa",
    about = "Expensa approval engine operator CLI",
    long_about = "Inspect configuration, apply migrations, check readiness, and exercise approval rule conditions.",
    after_help = "Examples:\n  expensa doctor --json\n  expensa evaluate --expr '#amount >= 300000' --context '{\"amount\": 450000}'\n  expensa lint-rules"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Inspect effective configuration values with source attribution")]
    Config,
    #[command(about = "Validate config, DB connectivity, schema state and stored rule conditions")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Evaluate one rule condition against a JSON context object")]
    Evaluate {
        #[arg(long, help = "Condition expression, e.g. `#amount >= 300000`")]
        expr: String,
        #[arg(long, default_value = "{}", help = "Flat JSON object of context fields")]
        context: String,
    },
    #[command(about = "Report stored rules whose condition no longer parses")]
    LintRules,
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::Evaluate { expr, context } => commands::evaluate::run(&expr, &context),
        Command::LintRules => commands::lint_rules::run(),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
