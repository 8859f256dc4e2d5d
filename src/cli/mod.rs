//! CLI argument parsing
//!
//! Defines command-line interface using clap.

use clap::{Parser, Subcommand};

use crate::models::RunId;
use crate::output::OutputFormat;

/// Run test suites as fanned-out work items
#[derive(Parser, Debug)]
#[command(name = "suite-harness")]
#[command(version)]
#[command(about = "Fan test suites out into work items and track their runs")]
#[command(long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Config file (default: standard locations)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Output format (table, json, json-pretty, csv, summary)
    #[arg(short, long, global = true, default_value = "table")]
    pub format: OutputFormat,

    /// Print statuses without ANSI colors
    #[arg(long, global = true)]
    pub no_color: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a run for a suite and execute it
    Run(RunArgs),

    /// List the suites available to `run`
    Suites,

    /// Show the progress of a run
    Status(StatusArgs),

    /// Show one work item of a run
    Item(ItemArgs),

    /// Show one failure with its full text
    Failure(FailureArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

/// Arguments for the run command
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Suite to run
    #[arg(short, long)]
    pub suite: String,

    /// Number of concurrent work items
    #[arg(long)]
    pub concurrent: Option<usize>,

    /// Per work item deadline in seconds
    #[arg(long)]
    pub deadline: Option<u64>,

    /// List every work item in the final summary
    #[arg(short, long)]
    pub details: bool,

    /// Do not save the store snapshot
    #[arg(long)]
    pub no_save: bool,
}

/// Arguments for the status command
#[derive(Parser, Debug)]
pub struct StatusArgs {
    pub run_id: RunId,

    /// List every work item
    #[arg(short, long)]
    pub details: bool,
}

#[derive(Parser, Debug)]
pub struct ItemArgs {
    pub run_id: RunId,
    pub work_item_id: String,
}

#[derive(Parser, Debug)]
pub struct FailureArgs {
    pub run_id: RunId,
    pub work_item_id: String,
    pub failure_id: String,
}

/// Arguments for configuration management
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Write an example configuration file
    Init {
        /// Output path (.yaml or .json)
        #[arg(short, long, default_value = "suite-harness.yaml")]
        output: String,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Show the effective configuration
    Show {
        /// Show environment overrides instead
        #[arg(long)]
        env: bool,

        /// Print as JSON instead of YAML
        #[arg(long)]
        json: bool,
    },

    /// Validate a configuration file
    Validate {
        /// File to validate (default: standard locations)
        file: Option<String>,
    },

    /// Print the JSON schema of the configuration file
    Schema,

    /// List supported environment variables
    Env,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_args() {
        let args = Args::parse_from([
            "suite-harness",
            "run",
            "--suite",
            "smoke",
            "--concurrent",
            "8",
            "--format",
            "json",
        ]);
        assert_eq!(args.format, OutputFormat::Json);
        match args.command {
            Command::Run(run) => {
                assert_eq!(run.suite, "smoke");
                assert_eq!(run.concurrent, Some(8));
                assert!(!run.no_save);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_failure_args() {
        let args = Args::parse_from(["suite-harness", "failure", "3", "net", "Harness Error"]);
        match args.command {
            Command::Failure(failure) => {
                assert_eq!(failure.run_id, 3);
                assert_eq!(failure.work_item_id, "net");
                assert_eq!(failure.failure_id, "Harness Error");
            }
            _ => panic!("Expected Failure command"),
        }
    }

    #[test]
    fn test_global_flags() {
        let args = Args::parse_from(["suite-harness", "status", "12", "--details", "-v"]);
        assert!(args.verbose);
        assert!(!args.no_color);
        assert_eq!(args.format, OutputFormat::Table);
        assert!(matches!(
            args.command,
            Command::Status(StatusArgs {
                run_id: 12,
                details: true
            })
        ));
    }

    #[test]
    fn test_no_color_after_subcommand() {
        let args = Args::parse_from(["suite-harness", "suites", "--no-color"]);
        assert!(args.no_color);
    }

    #[test]
    fn test_bad_format_rejected() {
        assert!(Args::try_parse_from(["suite-harness", "suites", "--format", "xml"]).is_err());
    }

    #[test]
    fn test_config_init() {
        let args = Args::parse_from(["suite-harness", "config", "init", "--force"]);
        match args.command {
            Command::Config(ConfigArgs {
                action: ConfigAction::Init { output, force },
            }) => {
                assert_eq!(output, "suite-harness.yaml");
                assert!(force);
            }
            _ => panic!("Expected config init"),
        }
    }
}
