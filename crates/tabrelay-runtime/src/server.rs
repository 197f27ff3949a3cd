//! UDS JSON-RPC control server.
//! Connection-per-request, newline-delimited JSON.

use std::path::Path;
use std::rc::Rc;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use tabrelay_core::TabId;
use tabrelay_core::protocol::{Request, Sender};

use crate::host::Host;
use crate::relay::RelayConnector;
use crate::service::BrokerService;

const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const PARSE_ERROR: i64 = -32700;

/// Run the control server until `shutdown` is cancelled.
pub(crate) async fn run_server<H, C>(
    socket_path: &str,
    service: Rc<BrokerService<H, C>>,
    shutdown: CancellationToken,
) -> anyhow::Result<()>
where
    H: Host + 'static,
    C: RelayConnector + 'static,
{
    let socket_dir = Path::new(socket_path)
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid socket path"))?;

    std::fs::create_dir_all(socket_dir)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(socket_dir, std::fs::Permissions::from_mode(0o700))?;
    }

    if Path::new(socket_path).exists() {
        if UnixStream::connect(socket_path).await.is_err() {
            std::fs::remove_file(socket_path)?;
            tracing::info!("removed stale socket at {socket_path}");
        } else {
            anyhow::bail!("another tabrelay host is already serving {socket_path}");
        }
    }

    let listener = UnixListener::bind(socket_path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
    }

    tracing::info!("control socket listening on {socket_path}");

    let result = loop {
        tokio::select! {
            () = shutdown.cancelled() => break Ok(()),
            accepted = listener.accept() => {
                let stream = match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => break Err(e.into()),
                };
                let service = Rc::clone(&service);
                tokio::task::spawn_local(async move {
                    if let Err(e) = handle_connection(stream, service).await {
                        tracing::debug!("control connection error: {e}");
                    }
                });
            }
        }
    };

    drop(listener);
    if let Err(e) = std::fs::remove_file(socket_path) {
        tracing::debug!("socket {socket_path} not removed: {e}");
    }
    result
}

async fn handle_connection<H, C>(stream: UnixStream, service: Rc<BrokerService<H, C>>) -> anyhow::Result<()>
where
    H: Host + 'static,
    C: RelayConnector + 'static,
{
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    reader.read_line(&mut line).await?;

    let response = match serde_json::from_str::<serde_json::Value>(line.trim()) {
        Ok(request) => handle_request(&service, &request).await,
        Err(e) => rpc_error(serde_json::Value::Null, PARSE_ERROR, &e.to_string()),
    };

    let mut resp = serde_json::to_string(&response)?;
    resp.push('\n');
    writer.write_all(resp.as_bytes()).await?;
    Ok(())
}

/// Answer one JSON-RPC request object.
pub(crate) async fn handle_request<H, C>(
    service: &Rc<BrokerService<H, C>>,
    request: &serde_json::Value,
) -> serde_json::Value
where
    H: Host + 'static,
    C: RelayConnector + 'static,
{
    let method = request["method"].as_str().unwrap_or("");
    let id = request["id"].clone();

    let request = match control_request(method, &request["params"]) {
        Ok(Some(request)) => request,
        Ok(None) => return rpc_error(id, METHOD_NOT_FOUND, "method not found"),
        Err(e) => return rpc_error(id, INVALID_PARAMS, &e.to_string()),
    };

    tracing::debug!(method, "control request");
    // Control clients are not tabs, so they never act as a selector.
    let response = service.dispatch(Sender::default(), request).await;
    serde_json::json!({
        "jsonrpc": "2.0",
        "result": response,
        "id": id,
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DisconnectParams {
    #[serde(default)]
    tab_id: Option<TabId>,
}

/// Map a control method onto a broker request. `Ok(None)` for methods the
/// control surface does not expose.
fn control_request(method: &str, params: &serde_json::Value) -> Result<Option<Request>, serde_json::Error> {
    let request = match method {
        "getConnectionStatus" => Request::GetConnectionStatus,
        "getAllConnections" => Request::GetAllConnections,
        "getTabs" => Request::GetTabs,
        "disconnect" => {
            let params = if params.is_null() {
                DisconnectParams::default()
            } else {
                DisconnectParams::deserialize(params)?
            };
            Request::Disconnect {
                tab_id: params.tab_id,
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(request))
}

fn rpc_error(id: serde_json::Value, code: i64, message: &str) -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "error": {"code": code, "message": message},
        "id": id,
    })
}
