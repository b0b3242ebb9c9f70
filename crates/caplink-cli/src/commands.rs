//! One-shot CLI commands

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use caplink_core::{
    CapCore, ConfigWatcher, ConnectionState, ExecutionRecord, ExecutionStatus, ServerConfig,
    ServerStatus, TomlConfigStore,
};

// ANSI color codes
pub const GREEN: &str = "\x1b[92m";
pub const RED: &str = "\x1b[91m";
pub const YELLOW: &str = "\x1b[93m";
pub const BLUE: &str = "\x1b[94m";
pub const BOLD: &str = "\x1b[1m";
pub const DIM: &str = "\x1b[2m";
pub const RESET: &str = "\x1b[0m";

pub fn print_status(ok: bool, msg: &str) {
    let icon = if ok {
        format!("{}✓{}", GREEN, RESET)
    } else {
        format!("{}✗{}", RED, RESET)
    };
    println!("  {} {}", icon, msg);
}

/// Build the core from the default config location
pub async fn build_core() -> Result<(Arc<CapCore>, std::path::PathBuf)> {
    let store = TomlConfigStore::default_path().context("Failed to locate config directory")?;
    let path = store.path().to_path_buf();
    tracing::debug!(path = %path.display(), "Loading server config");
    let core = CapCore::new(Arc::new(store))
        .await
        .with_context(|| format!("Failed to load server config from {}", path.display()))?;
    Ok((Arc::new(core), path))
}

fn state_colored(state: &ConnectionState) -> String {
    match state {
        ConnectionState::Connected => format!("{}connected{}", GREEN, RESET),
        ConnectionState::Connecting => format!("{}connecting{}", YELLOW, RESET),
        ConnectionState::Disconnected => format!("{}disconnected{}", DIM, RESET),
        ConnectionState::Error(_) => format!("{}error{}", RED, RESET),
    }
}

pub fn print_server(status: &ServerStatus) {
    let name = status
        .display_name
        .clone()
        .unwrap_or_else(|| status.id.clone());
    let enabled = if status.enabled {
        ""
    } else {
        " (disabled)"
    };
    println!(
        "  {} [{}]{} - {} ({} tools)",
        name,
        state_colored(&status.state),
        enabled,
        status.command,
        status.tool_count
    );
    if let Some(err) = &status.last_error {
        println!("    {}last error: {}{}", DIM, err, RESET);
    }
}

/// List configured servers and their states
pub async fn servers_list(json: bool) -> Result<()> {
    let (core, _) = build_core().await?;
    let servers = core.list_servers();

    if json {
        println!("{}", serde_json::to_string_pretty(&servers)?);
        return Ok(());
    }

    println!("{}Configured Servers ({}){}", BOLD, servers.len(), RESET);
    if servers.is_empty() {
        println!("  {}No servers configured{}", YELLOW, RESET);
        println!("  Add one with: {}caplink servers add <id> <command>{}", BLUE, RESET);
    }
    for status in &servers {
        print_server(status);
    }
    Ok(())
}

/// Add a server definition
#[allow(clippy::too_many_arguments)]
pub async fn servers_add(
    id: &str,
    command: &str,
    args: Vec<String>,
    env: Vec<String>,
    name: Option<String>,
    url: Option<String>,
    disabled: bool,
    timeout: u64,
) -> Result<()> {
    let mut config = ServerConfig::new(id, command)
        .with_args(args)
        .with_enabled(!disabled);
    config.timeout_secs = timeout;
    config.url = url;
    if let Some(name) = name {
        config = config.with_display_name(name);
    }
    for pair in env {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("invalid env pair '{}', expected KEY=VALUE", pair))?;
        config = config.with_env(key, value);
    }

    let (core, path) = build_core().await?;
    core.add_server(config).await?;
    print_status(true, &format!("Added server '{}' to {}", id, path.display()));
    Ok(())
}

/// Remove a server definition
pub async fn servers_rm(id: &str) -> Result<()> {
    let (core, _) = build_core().await?;
    core.remove_server(id).await?;
    print_status(true, &format!("Removed server '{}'", id));
    Ok(())
}

/// Connect one server, or every enabled one
pub async fn connect(id: Option<&str>) -> Result<()> {
    let (core, _) = build_core().await?;

    match id {
        Some(id) => {
            core.connect_server(id).await?;
            let status = core.server_status(id).context("server vanished")?;
            print_status(
                true,
                &format!("Connected '{}' ({} tools)", id, status.tool_count),
            );
        }
        None => {
            let failures = core.auto_connect_all().await;
            for status in core.list_servers() {
                print_server(&status);
            }
            for (id, reason) in &failures {
                print_status(false, &format!("{}: {}", id, reason));
            }
            if !failures.is_empty() {
                bail!("{} server(s) failed to connect", failures.len());
            }
        }
    }

    core.shutdown().await;
    Ok(())
}

/// Disconnect a server
pub async fn disconnect(id: &str) -> Result<()> {
    let (core, _) = build_core().await?;
    core.disconnect_server(id).await?;
    print_status(true, &format!("Disconnected '{}'", id));
    Ok(())
}

/// Re-read the config file and reconcile connections
pub async fn reload() -> Result<()> {
    let (core, path) = build_core().await?;
    core.reload_config().await?;
    print_status(true, &format!("Reloaded {}", path.display()));
    Ok(())
}

/// List tools exposed by connected servers
pub async fn tools(json: bool) -> Result<()> {
    let (core, _) = build_core().await?;
    let failures = core.auto_connect_all().await;
    let tools = core.list_tools();

    if json {
        println!("{}", serde_json::to_string_pretty(&tools)?);
    } else {
        let total: usize = tools.values().map(Vec::len).sum();
        println!("{}Available Tools ({}){}", BOLD, total, RESET);

        let mut servers: Vec<_> = tools.iter().collect();
        servers.sort_by_key(|(id, _)| id.clone());
        for (server, descriptors) in servers {
            println!("\n  {}{}{}", BOLD, server, RESET);
            for tool in descriptors {
                let callable = if tool.schema.is_callable() {
                    String::new()
                } else {
                    format!(" {}(not callable){}", RED, RESET)
                };
                let description = tool.description.clone().unwrap_or_default();
                println!(
                    "    {}{} {}{}{}",
                    tool.qualified_name, callable, DIM, description, RESET
                );
            }
        }
        for (id, reason) in &failures {
            print_status(false, &format!("{}: {}", id, reason));
        }
    }

    core.shutdown().await;
    Ok(())
}

pub fn print_record(record: &ExecutionRecord) {
    let status = match record.status {
        ExecutionStatus::Completed => format!("{}completed{}", GREEN, RESET),
        ExecutionStatus::Failed => format!("{}failed{}", RED, RESET),
        ExecutionStatus::Cancelled => format!("{}cancelled{}", YELLOW, RESET),
        _ => format!("{}{}{}", DIM, record.status.as_str(), RESET),
    };
    println!(
        "  {} [{}] {}ms",
        record.tool,
        status,
        record.duration_ms.unwrap_or_default()
    );
    if let Some(result) = &record.result {
        println!("{}", result);
    }
    if let Some(error) = &record.error {
        println!("  {}{}{}", RED, error, RESET);
    }
}

/// Execute a tool and print its terminal record
pub async fn call(tool: &str, args: Option<&str>, session: &str, json: bool) -> Result<()> {
    let arguments: serde_json::Value = match args {
        Some(raw) => serde_json::from_str(raw).context("arguments must be a JSON object")?,
        None => serde_json::json!({}),
    };

    let (core, _) = build_core().await?;
    core.auto_connect_all().await;

    let record = core.execute_tool(tool, arguments, session).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        print_record(&record);
    }

    let status = record.status;
    core.shutdown().await;
    if status != ExecutionStatus::Completed {
        bail!("execution ended {}", status.as_str());
    }
    Ok(())
}

/// Probe every configured server and report health
pub async fn health() -> Result<()> {
    let (core, _) = build_core().await?;
    let failures = core.auto_connect_all().await;
    let summary = core.check_all_health().await;

    println!(
        "{}Server Health ({}/{} connected){}",
        BOLD, summary.connected_servers, summary.total_servers, RESET
    );
    for (id, healthy) in &summary.servers {
        print_status(*healthy, id);
    }
    for (id, reason) in &failures {
        println!("    {}{}: {}{}", DIM, id, reason, RESET);
    }

    core.shutdown().await;
    Ok(())
}

/// Watch the config file, reloading and reconnecting on changes
pub async fn watch() -> Result<()> {
    let (core, path) = build_core().await?;
    core.auto_connect_all().await;

    let mut rx = core.subscribe();
    let mut watcher = ConfigWatcher::new(&path)?;
    watcher.start()?;

    println!(
        "{}Watching {} (ctrl-c to stop){}",
        BOLD,
        path.display(),
        RESET
    );
    for status in core.list_servers() {
        print_server(&status);
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = rx.recv() => {
                if let Ok(caplink_core::CoreEvent::ServerStateChanged { server, state }) = event {
                    println!("  {}{} -> {}{}", DIM, server, state, RESET);
                }
            }
            _ = tokio::time::sleep(Duration::from_millis(500)) => {
                if !watcher.poll_events().is_empty() {
                    println!("{}Config changed, reloading{}", YELLOW, RESET);
                    if let Err(e) = core.reload_config().await {
                        print_status(false, &format!("reload failed: {}", e));
                        continue;
                    }
                    let failures = core.auto_connect_all().await;
                    for (id, reason) in &failures {
                        print_status(false, &format!("{}: {}", id, reason));
                    }
                }
            }
        }
    }

    watcher.stop()?;
    core.shutdown().await;
    Ok(())
}
