use std::collections::HashMap;
use std::io::{self, BufRead};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::sync::mpsc;

use syspilot_dispatch::{Completion, DispatchCoordinator, InvocationState};
use syspilot_tools::{InvocationId, ToolInvocation, ToolName};

type CompletionStore = Arc<Mutex<HashMap<InvocationId, Completion>>>;

/// Line console.  Input is read on a blocking thread that submits directly
/// to the coordinator; results are printed by a separate task as they
/// complete, so a slow command never holds up the prompt.
pub(crate) async fn run_console(
    coordinator: DispatchCoordinator,
    completions: mpsc::UnboundedReceiver<Completion>,
) -> Result<()> {
    println!("syspilot console");
    println!("commands: run <command>, mail-read [query], mail-send <to> | <subject> | <body>,");
    println!("          date, tool <name> <json-args>, cancel <id>, status, json <id>, help, quit");

    let store: CompletionStore = Arc::default();
    let printer = tokio::spawn(print_completions(completions, Arc::clone(&store)));

    let input_store = Arc::clone(&store);
    let session = tokio::task::spawn_blocking(move || read_lines(&coordinator, &input_store)).await;

    printer.abort();
    session?
}

async fn print_completions(mut rx: mpsc::UnboundedReceiver<Completion>, store: CompletionStore) {
    while let Some(completion) = rx.recv().await {
        println!("{}", render_completion(&completion));
        if let Ok(mut done) = store.lock() {
            done.insert(completion.invocation_id.clone(), completion);
        }
    }
}

fn render_completion(completion: &Completion) -> String {
    let id = &completion.invocation_id;
    let result = &completion.result;
    let mut header = format!("[{id}] {} {}", completion.tool, completion.state.as_str());
    if let Some(execution) = &completion.execution {
        header.push_str(&format!(
            " (exit {}, {} ms, {} attempt(s))",
            execution.exit_status,
            execution.duration.as_millis(),
            execution.attempts
        ));
    }
    if let Some(error) = &result.error {
        header.push_str(&format!(": {error}"));
    }
    if result.payload.trim().is_empty() {
        header
    } else {
        format!("{header}\n{}", result.payload.trim_end())
    }
}

fn read_lines(coordinator: &DispatchCoordinator, store: &CompletionStore) -> Result<()> {
    let stdin = io::stdin();
    let mut next_id = 0u64;
    for line in stdin.lock().lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (word, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();

        let invocation = match word.trim_start_matches('/') {
            "quit" | "exit" => break,
            "help" => {
                print_help();
                continue;
            }
            "status" => {
                let pending = coordinator.in_flight();
                if pending.is_empty() {
                    println!("no invocations in flight");
                }
                for (id, state) in pending {
                    println!("{id}: {}", state.as_str());
                }
                continue;
            }
            "cancel" => {
                let id = InvocationId::new(rest);
                if coordinator.cancel(&id) {
                    println!("[{id}] cancellation requested");
                } else {
                    let state = coordinator.state(&id).map(InvocationState::as_str);
                    println!("[{id}] not executing ({})", state.unwrap_or("unknown id"));
                }
                continue;
            }
            "json" => {
                let id = InvocationId::new(rest);
                let found = store.lock().ok().and_then(|done| done.get(&id).cloned());
                match found {
                    Some(completion) => println!("{}", serde_json::to_string_pretty(&completion)?),
                    None => println!("[{id}] no result yet"),
                }
                continue;
            }
            other => {
                next_id += 1;
                match parse_invocation(InvocationId::new(format!("inv-{next_id}")), other, rest) {
                    Ok(invocation) => invocation,
                    Err(usage) => {
                        println!("{usage}");
                        continue;
                    }
                }
            }
        };

        match coordinator.submit(invocation.with_turn("console")) {
            Ok(handle) => println!("[{}] submitted", handle.invocation_id()),
            Err(err) => println!("rejected: {err}"),
        }
    }
    println!("session closed");
    Ok(())
}

/// Turn a console verb into a tool invocation, or return a usage message.
fn parse_invocation(id: InvocationId, verb: &str, rest: &str) -> Result<ToolInvocation, String> {
    let invocation = match verb {
        "run" => {
            if rest.is_empty() {
                return Err("usage: run <command>".to_string());
            }
            ToolInvocation::run_command(id, rest)
        }
        "mail-read" => {
            let invocation = ToolInvocation::new(id, ToolName::MailboxRead);
            if rest.is_empty() {
                invocation
            } else {
                invocation.with_param("query", serde_json::json!(rest))
            }
        }
        "mail-send" => {
            let parts: Vec<&str> = rest.splitn(3, '|').map(str::trim).collect();
            let [to, subject, body] = parts.as_slice() else {
                return Err("usage: mail-send <to> | <subject> | <body>".to_string());
            };
            ToolInvocation::new(id, ToolName::MailboxSend)
                .with_param("to", serde_json::json!(to))
                .with_param("subject", serde_json::json!(subject))
                .with_param("body", serde_json::json!(body))
        }
        "date" => ToolInvocation::new(id, ToolName::TodayDate),
        "tool" => {
            let (name, args) = rest.split_once(' ').unwrap_or((rest, "{}"));
            if name.is_empty() {
                return Err("usage: tool <name> <json-args>".to_string());
            }
            let args: serde_json::Value = serde_json::from_str(args.trim())
                .map_err(|e| format!("invalid json arguments: {e}"))?;
            ToolInvocation::from_tool_call(id.as_str(), name, &args, "console")
        }
        other => return Err(format!("unknown command '{other}', type help")),
    };
    Ok(invocation)
}

fn print_help() {
    println!("run <command>                       run a shell command on the target");
    println!("mail-read [query]                   search the mailbox");
    println!("mail-send <to> | <subject> | <body> send an email");
    println!("date                                today's date");
    println!("tool <name> <json-args>             raw tool call, as the agent would send it");
    println!("cancel <id>                         cancel an executing invocation");
    println!("status                              list invocations in flight");
    println!("json <id>                           print a finished invocation as JSON");
    println!("quit");
}
