//! Interactive session
//!
//! Keeps one core alive across commands so in-flight executions can be
//! listed and cancelled, and history/statistics accumulate.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use caplink_core::{CapCore, CoreEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use uuid::Uuid;

use crate::commands::{
    self, print_record, print_server, print_status, BLUE, BOLD, DIM, RESET, YELLOW,
};

const HELP: &str = "\
  servers                list configured servers
  connect <id|all>       connect a server (or all enabled)
  disconnect <id>        disconnect a server
  reload                 re-read the config file
  tools                  list available tools
  call <tool> [json]     execute a tool and wait
  bg <tool> [json]       execute a tool in the background
  active                 list in-flight executions
  cancel <uuid>          cancel an in-flight execution
  history [session]      list finished executions
  stats [session]        execution statistics
  prune <secs>           drop history entries older than <secs>
  health                 probe connected servers
  help                   show this help
  quit                   exit";

pub async fn run() -> Result<()> {
    let (core, path) = commands::build_core().await?;

    println!("{}caplink{} - config: {}", BOLD, RESET, path.display());
    let failures = core.auto_connect_all().await;
    for status in core.list_servers() {
        print_server(&status);
    }
    for (id, reason) in &failures {
        print_status(false, &format!("{}: {}", id, reason));
    }
    println!("Type {}help{} for commands", BLUE, RESET);

    // Lifecycle events from background executions land between prompts
    let mut events = core.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                CoreEvent::ExecutionCompleted { invocation_id, tool } => {
                    println!("\n{}[{}] {} completed{}", DIM, invocation_id, tool, RESET);
                }
                CoreEvent::ExecutionFailed {
                    invocation_id,
                    tool,
                    error,
                } => {
                    println!(
                        "\n{}[{}] {} failed: {}{}",
                        DIM, invocation_id, tool, error, RESET
                    );
                }
                CoreEvent::ExecutionCancelled { invocation_id, tool } => {
                    println!("\n{}[{}] {} cancelled{}", DIM, invocation_id, tool, RESET);
                }
                _ => {}
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("caplink> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break; // EOF
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (cmd, rest) = match line.split_once(char::is_whitespace) {
            Some((cmd, rest)) => (cmd, rest.trim()),
            None => (line, ""),
        };

        let result = dispatch(&core, cmd, rest).await;
        match result {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => println!("  {}error: {:#}{}", YELLOW, e, RESET),
        }
    }

    core.shutdown().await;
    Ok(())
}

/// Returns `Ok(false)` when the session should end
async fn dispatch(core: &Arc<CapCore>, cmd: &str, rest: &str) -> Result<bool> {
    match cmd {
        "help" | "?" => println!("{}", HELP),
        "quit" | "exit" => return Ok(false),

        "servers" => {
            for status in core.list_servers() {
                print_server(&status);
            }
        }
        "connect" => {
            if rest.is_empty() || rest == "all" {
                let failures = core.auto_connect_all().await;
                for (id, reason) in &failures {
                    print_status(false, &format!("{}: {}", id, reason));
                }
                if failures.is_empty() {
                    print_status(true, "All enabled servers connected");
                }
            } else {
                core.connect_server(rest).await?;
                print_status(true, &format!("Connected '{}'", rest));
            }
        }
        "disconnect" => {
            anyhow::ensure!(!rest.is_empty(), "usage: disconnect <id>");
            core.disconnect_server(rest).await?;
            print_status(true, &format!("Disconnected '{}'", rest));
        }
        "reload" => {
            core.reload_config().await?;
            print_status(true, "Config reloaded");
        }

        "tools" => {
            let tools = core.list_tools();
            let mut servers: Vec<_> = tools.iter().collect();
            servers.sort_by_key(|(id, _)| id.clone());
            for (server, descriptors) in servers {
                println!("  {}{}{}", BOLD, server, RESET);
                for tool in descriptors {
                    println!("    {}", tool.qualified_name);
                }
            }
        }

        "call" => {
            let (tool, arguments) = parse_call(rest)?;
            let record = core.execute_tool(&tool, arguments, "shell").await?;
            print_record(&record);
        }
        "bg" => {
            let (tool, arguments) = parse_call(rest)?;
            // Resolve up front so a bad name fails at the prompt
            let descriptor = core.resolve_tool(&tool)?;
            let runner = Arc::clone(core);
            tokio::spawn(async move {
                let _ = runner.execute_tool(&tool, arguments, "shell").await;
            });
            // Give the engine a beat so `active` can pick up the id
            tokio::time::sleep(Duration::from_millis(10)).await;
            for record in core.active_executions() {
                if record.tool == descriptor.qualified_name {
                    println!("  started {}", record.invocation_id);
                }
            }
        }

        "active" => {
            let active = core.active_executions();
            if active.is_empty() {
                println!("  {}no active executions{}", DIM, RESET);
            }
            for record in active {
                println!(
                    "  {} {} [{}] since {}",
                    record.invocation_id,
                    record.tool,
                    record.status.as_str(),
                    record.started_at.format("%H:%M:%S")
                );
            }
        }
        "cancel" => {
            let id: Uuid = rest.parse().map_err(|_| {
                anyhow::anyhow!("usage: cancel <uuid> (see `active` for ids)")
            })?;
            if core.cancel_execution(id) {
                print_status(true, "Cancellation requested");
            } else {
                println!("  {}no active execution with that id{}", DIM, RESET);
            }
        }

        "history" => {
            let session = (!rest.is_empty()).then_some(rest);
            for record in core.execution_history(session) {
                println!(
                    "  {} {} [{}] {}ms",
                    record.started_at.format("%H:%M:%S"),
                    record.tool,
                    record.status.as_str(),
                    record.duration_ms.unwrap_or_default()
                );
            }
        }
        "stats" => {
            let session = (!rest.is_empty()).then_some(rest);
            let stats = core.execution_statistics(session);
            println!(
                "  total: {}  succeeded: {}  failed: {}  cancelled: {}",
                stats.total, stats.succeeded, stats.failed, stats.cancelled
            );
            println!(
                "  total time: {}ms  average: {:.1}ms",
                stats.total_duration_ms, stats.average_duration_ms
            );
        }
        "prune" => {
            let secs: u64 = rest.parse().map_err(|_| anyhow::anyhow!("usage: prune <secs>"))?;
            let removed = core.prune_history(Duration::from_secs(secs));
            println!("  pruned {} record(s)", removed);
        }

        "health" => {
            let summary = core.check_all_health().await;
            for (id, healthy) in &summary.servers {
                print_status(*healthy, id);
            }
        }

        other => println!("  unknown command '{}', try {}help{}", other, BLUE, RESET),
    }

    Ok(true)
}

/// Split `<tool> [json]` into a name and parsed arguments
fn parse_call(rest: &str) -> Result<(String, serde_json::Value)> {
    anyhow::ensure!(!rest.is_empty(), "usage: call <tool> [json]");
    let (tool, raw_args) = match rest.split_once(char::is_whitespace) {
        Some((tool, args)) => (tool, args.trim()),
        None => (rest, ""),
    };
    let arguments = if raw_args.is_empty() {
        serde_json::json!({})
    } else {
        serde_json::from_str(raw_args)
            .map_err(|e| anyhow::anyhow!("arguments must be a JSON object: {}", e))?
    };
    Ok((tool.to_string(), arguments))
}
