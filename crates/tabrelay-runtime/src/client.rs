//! UDS JSON-RPC client for CLI subcommands.

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

pub(crate) async fn rpc_call(
    socket_path: &str,
    method: &str,
    params: serde_json::Value,
) -> anyhow::Result<serde_json::Value> {
    let stream = UnixStream::connect(socket_path)
        .await
        .map_err(|e| anyhow::anyhow!("cannot connect to tabrelay host at {socket_path}: {e}"))?;

    let (reader, mut writer) = stream.into_split();

    let request = serde_json::json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
        "id": 1,
    });
    let mut req = serde_json::to_string(&request)?;
    req.push('\n');
    writer.write_all(req.as_bytes()).await?;
    writer.shutdown().await?;

    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    reader.read_line(&mut line).await?;

    let response: serde_json::Value = serde_json::from_str(line.trim())?;

    if let Some(error) = response.get("error") {
        anyhow::bail!("RPC error: {error}");
    }

    Ok(response["result"].clone())
}

fn print_result(result: &serde_json::Value, json: bool, human: impl FnOnce(&serde_json::Value) -> String) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
    } else {
        print!("{}", human(result));
    }
    Ok(())
}

/// `tabrelay status`: which tabs are bound, and the most recent one.
pub async fn cmd_status(socket_path: &str, json: bool) -> anyhow::Result<()> {
    let result = rpc_call(socket_path, "getConnectionStatus", serde_json::json!({})).await?;
    print_result(&result, json, format_status)
}

/// `tabrelay connections`: every bound tab with its connection age.
pub async fn cmd_connections(socket_path: &str, json: bool) -> anyhow::Result<()> {
    let result = rpc_call(socket_path, "getAllConnections", serde_json::json!({})).await?;
    print_result(&result, json, |r| format_connections(r, Utc::now()))
}

/// `tabrelay tabs`: tabs a relay link could be bound to.
pub async fn cmd_tabs(socket_path: &str, json: bool) -> anyhow::Result<()> {
    let result = rpc_call(socket_path, "getTabs", serde_json::json!({})).await?;
    if result["success"] == serde_json::Value::Bool(false) {
        anyhow::bail!(
            "tab query failed: {}",
            result["error"].as_str().unwrap_or("unknown error")
        );
    }
    print_result(&result, json, format_tabs)
}

/// `tabrelay disconnect [--tab ID]`.
pub async fn cmd_disconnect(socket_path: &str, tab: Option<i64>, json: bool) -> anyhow::Result<()> {
    let params = match tab {
        Some(tab) => serde_json::json!({"tabId": tab}),
        None => serde_json::json!({}),
    };
    let result = rpc_call(socket_path, "disconnect", params).await?;
    print_result(&result, json, |_| match tab {
        Some(tab) => format!("disconnected tab {tab}\n"),
        None => "disconnected all tabs\n".to_string(),
    })
}

// ─── Formatting ──────────────────────────────────────────────────────

pub(crate) fn format_status(status: &serde_json::Value) -> String {
    let ids: Vec<String> = status["connectedTabIds"]
        .as_array()
        .map(|ids| ids.iter().map(ToString::to_string).collect())
        .unwrap_or_default();
    if ids.is_empty() {
        return "no active connections\n".to_string();
    }
    let latest = status["connectedTabId"]
        .as_i64()
        .map_or_else(|| "-".to_string(), |id| id.to_string());
    format!(
        "{} connected tab(s): {} (latest: {latest})\n",
        ids.len(),
        ids.join(", ")
    )
}

pub(crate) fn format_connections(result: &serde_json::Value, now: DateTime<Utc>) -> String {
    let Some(conns) = result["connections"].as_array().filter(|c| !c.is_empty()) else {
        return "no active connections\n".to_string();
    };
    let mut out = String::new();
    for conn in conns {
        let tab = conn["tabId"].as_i64().unwrap_or_default();
        let age = conn["connectedAt"]
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| format_age((now - t.with_timezone(&Utc)).num_seconds()))
            .unwrap_or_else(|| "?".to_string());
        out.push_str(&format!("tab {tab:<8} connected {age} ago\n"));
    }
    out
}

pub(crate) fn format_tabs(result: &serde_json::Value) -> String {
    let Some(tabs) = result["tabs"].as_array().filter(|t| !t.is_empty()) else {
        return "no selectable tabs\n".to_string();
    };
    let current = result["currentTabId"].as_i64();
    let mut out = String::new();
    for tab in tabs {
        let id = tab["id"].as_i64().unwrap_or_default();
        let marker = if Some(id) == current { '*' } else { ' ' };
        out.push_str(&format!(
            "{marker} {id:<8} w{:<6} {}  <{}>\n",
            tab["windowId"].as_i64().unwrap_or_default(),
            tab["title"].as_str().unwrap_or(""),
            tab["url"].as_str().unwrap_or(""),
        ));
    }
    out
}

/// Compact age: `42s`, `5m`, `3h`, `2d`.
fn format_age(secs: i64) -> String {
    let secs = secs.max(0);
    match secs {
        0..60 => format!("{secs}s"),
        60..3_600 => format!("{}m", secs / 60),
        3_600..86_400 => format!("{}h", secs / 3_600),
        _ => format!("{}d", secs / 86_400),
    }
}
