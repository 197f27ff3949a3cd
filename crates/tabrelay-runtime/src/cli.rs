//! CLI definition using clap derive.

use std::time::Duration;

use clap::{Parser, Subcommand};

use tabrelay_core::BrokerConfig;
use tabrelay_core::types::{DEFAULT_HANDSHAKE_TIMEOUT_MS, DEFAULT_PENDING_TIMEOUT_MS};

use crate::bridge::{DEFAULT_HOST_CALL_TIMEOUT_MS, HostCallConfig};

#[derive(Parser)]
#[command(name = "tabrelay", about = "Browser tab relay broker", version)]
pub struct Cli {
    /// UDS socket path (default: $XDG_RUNTIME_DIR/tabrelay/tabrelay.sock)
    #[arg(long, short = 's', global = true, env = "TABRELAY_SOCKET")]
    pub socket_path: Option<String>,

    #[command(flatten)]
    pub host: HostOpts,

    /// Extension origin the browser passes when it launches a native host.
    #[arg(hide = true)]
    pub origin: Option<String>,

    /// Native window handle some browsers pass on Windows.
    #[arg(long, hide = true)]
    pub parent_window: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the native-messaging host (bridge + control socket)
    Host,
    /// Show which tabs are bound to relay links
    Status(OutputOpts),
    /// List active connections with their age
    Connections(OutputOpts),
    /// List tabs a relay link can be bound to
    Tabs(OutputOpts),
    /// Close the connection on one tab, or all of them
    Disconnect(DisconnectOpts),
}

#[derive(clap::Args)]
pub struct OutputOpts {
    /// Print the raw JSON result
    #[arg(long)]
    pub json: bool,
}

#[derive(clap::Args)]
pub struct DisconnectOpts {
    /// Tab to disconnect (default: every tab)
    #[arg(long)]
    pub tab: Option<i64>,

    /// Print the raw JSON result
    #[arg(long)]
    pub json: bool,
}

#[derive(clap::Args, Debug, Clone)]
pub struct HostOpts {
    /// Relay handshake budget in milliseconds
    #[arg(long, global = true, env = "TABRELAY_HANDSHAKE_TIMEOUT_MS", default_value_t = DEFAULT_HANDSHAKE_TIMEOUT_MS)]
    pub handshake_timeout_ms: u64,

    /// How long an unfocused pending selection survives, in milliseconds
    #[arg(long, global = true, env = "TABRELAY_PENDING_TIMEOUT_MS", default_value_t = DEFAULT_PENDING_TIMEOUT_MS)]
    pub pending_timeout_ms: u64,

    /// How long a browser call may take before it fails, in milliseconds
    #[arg(long, global = true, env = "TABRELAY_HOST_CALL_TIMEOUT_MS", default_value_t = DEFAULT_HOST_CALL_TIMEOUT_MS)]
    pub host_call_timeout_ms: u64,

    /// Do not serve the control socket
    #[arg(long, global = true, env = "TABRELAY_NO_CONTROL_SOCKET")]
    pub no_control_socket: bool,
}

impl HostOpts {
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            pending_timeout: Duration::from_millis(self.pending_timeout_ms),
        }
    }

    pub(crate) fn host_call_config(&self) -> HostCallConfig {
        HostCallConfig {
            timeout: Duration::from_millis(self.host_call_timeout_ms),
        }
    }
}

/// Default socket path using $USER for per-user isolation.
pub fn default_socket_path() -> String {
    if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR") {
        return format!("{dir}/tabrelay/tabrelay.sock");
    }
    let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    format!("/tmp/tabrelay-{user}/tabrelay.sock")
}
