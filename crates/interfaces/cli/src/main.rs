mod console;
mod pipeline;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use syspilot_audit::{AuditEntry, AuditRecord, JsonlAuditLog};
use syspilot_config::AppConfig;
use syspilot_policy::{PolicyEngine, Rule};
use syspilot_tools::{InvocationId, ToolInvocation};

use crate::pipeline::Pipeline;

#[derive(Debug, Parser)]
#[command(
    name = "syspilot",
    version,
    about = "Safety-gated command dispatch for agent tool calls"
)]
struct Cli {
    /// Configuration file; a missing file means built-in defaults.
    #[arg(long, global = true, default_value = "config/default.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Evaluate a command against the policy without running it.
    Check {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
    /// Run one command through the full pipeline and print its result.
    Run {
        /// Max execution time in seconds (clamped to the configured maximum).
        #[arg(long)]
        timeout_secs: Option<u64>,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
    /// Print the ordered policy rule set.
    Rules,
    /// Print the tool schemas offered to the agent (OpenAI format).
    Tools,
    /// Print the most recent audit records.
    Audit {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Interactive console (default).
    Console,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = AppConfig::load_from(&cli.config)?;
    init_tracing(&config.telemetry.log_level);

    match cli.command.unwrap_or(Commands::Console) {
        Commands::Check { command } => {
            let engine = PolicyEngine::from_config(&config.policy)?;
            let verdict = engine.evaluate(&command.join(" "));
            println!(
                "{}: {}{}",
                verdict.decision.as_str(),
                verdict.reason,
                verdict
                    .matched_rule
                    .as_deref()
                    .map(|r| format!(" (rule {r})"))
                    .unwrap_or_default()
            );
            return Ok(if verdict.is_allow() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(2)
            });
        }
        Commands::Run {
            timeout_secs,
            command,
        } => {
            let pipeline = Pipeline::build(&config).await?;
            let mut invocation =
                ToolInvocation::run_command(InvocationId::generate(), command.join(" "))
                    .with_turn("cli");
            if let Some(secs) = timeout_secs {
                invocation = invocation.with_param("timeout_secs", serde_json::json!(secs));
            }
            let result = pipeline.coordinator.submit(invocation)?.wait().await;
            pipeline.shutdown().await;

            if !result.payload.is_empty() {
                println!("{}", result.payload.trim_end());
            }
            if let Some(error) = &result.error {
                eprintln!("error: {error}");
            }
            return Ok(if result.success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            });
        }
        Commands::Rules => {
            let engine = PolicyEngine::from_config(&config.policy)?;
            println!(
                "default decision: {} (chaining {}, max length {})",
                config.policy.default_decision.as_str(),
                if config.policy.allow_chaining { "allowed" } else { "rejected" },
                config.policy.max_command_len
            );
            print_rules("deny rules", engine.deny_rules());
            print_rules("allow rules", engine.allow_rules());
        }
        Commands::Tools => {
            println!("{}", serde_json::to_string_pretty(&syspilot_tools::openai_tools())?);
        }
        Commands::Audit { limit } => {
            let log = JsonlAuditLog::new(&config.audit.path);
            let records = log.read_all()?;
            if records.is_empty() {
                println!("no audit records in {}", log.path().display());
            }
            let skip = records.len().saturating_sub(limit);
            for record in &records[skip..] {
                println!("{}", render_record(record));
            }
        }
        Commands::Console => {
            let pipeline = Pipeline::build(&config).await?;
            let Pipeline {
                coordinator,
                completions,
                sessions,
            } = pipeline;
            console::run_console(coordinator.clone(), completions).await?;
            let cancelled = coordinator.cancel_all();
            if cancelled > 0 {
                tracing::info!(cancelled, "cancelled in-flight invocations on exit");
            }
            sessions.close().await;
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn init_tracing(fallback_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(fallback_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_rules(title: &str, rules: &[Rule]) {
    println!("── {title} ──────────────────────────────────────────");
    if rules.is_empty() {
        println!("  (none)");
    }
    for (i, rule) in rules.iter().enumerate() {
        println!(
            "  {:>2}. {:<16} {:<8} {:<28} → {}",
            i + 1,
            rule.id(),
            rule.kind().as_str(),
            rule.pattern(),
            rule.reason()
        );
    }
}

fn render_record(record: &AuditRecord) -> String {
    let detail = match &record.entry {
        AuditEntry::Verdict {
            decision,
            reason,
            matched_rule,
        } => match matched_rule {
            Some(rule) => format!("{decision} {reason} rule={rule}"),
            None => format!("{decision} {reason}"),
        },
        AuditEntry::Execution {
            outcome,
            exit_status,
            duration_ms,
            attempts,
            ..
        } => format!(
            "{outcome} exit={} {duration_ms}ms attempts={attempts}",
            exit_status.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string())
        ),
        AuditEntry::ToolCompleted { success, error } => match error {
            Some(error) => format!("success={success} error={error}"),
            None => format!("success={success}"),
        },
        AuditEntry::Rejected { error } => error.clone(),
    };
    format!(
        "{} {} {:<14} {:<14} {} | {}",
        record.recorded_at.format("%Y-%m-%d %H:%M:%S"),
        record.invocation_id,
        record.tool,
        record.entry.kind(),
        detail,
        record.request_text
    )
}
