//! Termpilot 命令行入口
//!
//! - `termpilot validate <plan.json>`：加载并校验计划，打印步骤概要（非法时退出码 1）
//! - `termpilot check <command>...`：用危险命令黑名单检查一条命令
//! - `termpilot config [path]`：打印合并后的有效配置

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use termpilot::config::load_config;
use termpilot::plan::{dangerous_match, validate_plan, ExecutionPlan};

/// Command completion detection and plan execution for interactive shell sessions
#[derive(Parser, Debug)]
#[command(name = "termpilot")]
#[command(about = "termpilot - validate execution plans and check shell commands", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Commands {
    /// Load a plan JSON file, validate it and print a step summary
    Validate {
        /// Plan file (camelCase wire JSON)
        plan: PathBuf,
    },
    /// Check a command against the dangerous-command denylist
    Check {
        /// Command to check; remaining arguments are joined with spaces
        #[arg(required = true, num_args = 1.., trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Print the effective configuration (defaults, files and TERMPILOT__* overrides)
    Config {
        /// Extra configuration file layered over config/default.toml
        path: Option<PathBuf>,
    },
}

fn validate(path: &Path) -> anyhow::Result<ExitCode> {
    let json = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let plan = ExecutionPlan::from_json(&json).with_context(|| format!("Failed to parse plan {}", path.display()))?;

    if let Err(e) = validate_plan(&plan) {
        eprintln!("invalid plan: {e}");
        return Ok(ExitCode::from(1));
    }
    println!(
        "{}: {} step(s), maxRetries {}, maxTotalTime {}s",
        plan.title,
        plan.steps.len(),
        plan.max_retries,
        plan.max_total_time
    );
    for step in &plan.steps {
        println!(
            "  [{}] {} ({} success / {} failure criteria, timeout {}s)",
            step.id,
            step.command,
            step.success_criteria.len(),
            step.failure_criteria.len(),
            step.timeout_seconds
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn check(command: &str) -> ExitCode {
    match dangerous_match(command) {
        Some(pattern) => {
            println!("rejected: matches {pattern}");
            ExitCode::from(1)
        }
        None => {
            println!("ok");
            ExitCode::SUCCESS
        }
    }
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    termpilot::observability::init();

    match cli.command {
        Commands::Validate { plan } => validate(&plan),
        Commands::Check { command } => Ok(check(&command.join(" "))),
        Commands::Config { path } => {
            let config = load_config(path).context("Failed to load config")?;
            println!("{config:#?}");
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_check_joins_trailing_words() {
        let cli = Cli::try_parse_from(["termpilot", "check", "rm", "-rf", "/"]).unwrap();
        assert_eq!(
            cli.command,
            Commands::Check {
                command: vec!["rm".to_string(), "-rf".to_string(), "/".to_string()]
            }
        );
    }

    #[test]
    fn test_missing_arguments_are_rejected() {
        assert!(Cli::try_parse_from(["termpilot", "check"]).is_err());
        assert!(Cli::try_parse_from(["termpilot", "validate"]).is_err());
        assert!(Cli::try_parse_from(["termpilot"]).is_err());
    }

    #[test]
    fn test_config_path_is_optional() {
        let cli = Cli::try_parse_from(["termpilot", "config"]).unwrap();
        assert_eq!(cli.command, Commands::Config { path: None });
    }
}
