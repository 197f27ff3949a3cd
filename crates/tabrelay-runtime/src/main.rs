//! tabrelay: browser tab relay broker.
//! Single-process binary: native-messaging bridge, broker service and
//! control socket all run on one current-thread runtime.

use std::rc::Rc;

use clap::Parser;
use tokio_util::sync::CancellationToken;

mod bridge;
mod cli;
mod client;
mod host;
mod relay;
mod server;
mod service;
#[cfg(test)]
mod testing;

fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, run(args))
}

async fn run(args: cli::Cli) -> anyhow::Result<()> {
    let socket_path = args.socket_path.unwrap_or_else(cli::default_socket_path);

    // Browsers launch the host with their origin and no subcommand.
    let command = args.command.unwrap_or_else(|| match args.origin {
        Some(_) => cli::Command::Host,
        None => cli::Command::Status(cli::OutputOpts { json: false }),
    });

    match command {
        cli::Command::Host => {
            init_tracing("info");
            if let Some(origin) = &args.origin {
                tracing::info!(origin = %origin, parent_window = ?args.parent_window, "launched by browser");
            }
            run_host(&args.host, &socket_path).await?;
        }
        cli::Command::Status(opts) => {
            init_tracing("warn");
            client::cmd_status(&socket_path, opts.json).await?;
        }
        cli::Command::Connections(opts) => {
            init_tracing("warn");
            client::cmd_connections(&socket_path, opts.json).await?;
        }
        cli::Command::Tabs(opts) => {
            init_tracing("warn");
            client::cmd_tabs(&socket_path, opts.json).await?;
        }
        cli::Command::Disconnect(opts) => {
            init_tracing("warn");
            client::cmd_disconnect(&socket_path, opts.tab, opts.json).await?;
        }
    }

    Ok(())
}

/// Logs go to stderr; stdout carries native-messaging frames.
fn init_tracing(default: &str) {
    let filter = std::env::var("TABRELAY_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| default.to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();
}

async fn run_host(opts: &cli::HostOpts, socket_path: &str) -> anyhow::Result<()> {
    let broker_config = opts.broker_config();
    tracing::info!(?broker_config, "tabrelay host starting");

    let (host, outbound) = bridge::BridgeHost::new(opts.host_call_config());
    let connector = relay::WsConnector::new(broker_config.handshake_timeout);
    let service = service::BrokerService::new(broker_config, Rc::clone(&host), connector);

    let shutdown = CancellationToken::new();
    let control = (!opts.no_control_socket).then(|| {
        let service = Rc::clone(&service);
        let shutdown = shutdown.clone();
        let socket_path = socket_path.to_string();
        tokio::task::spawn_local(async move {
            if let Err(e) = server::run_server(&socket_path, service, shutdown).await {
                tracing::warn!("control socket unavailable: {e}");
            }
        })
    });

    let interrupted = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("interrupted"),
            Err(e) => {
                tracing::warn!("cannot listen for ctrl-c: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    let result = bridge::serve(
        tokio::io::stdin(),
        tokio::io::stdout(),
        host,
        outbound,
        service,
        interrupted,
    )
    .await
    .map_err(anyhow::Error::from);

    shutdown.cancel();
    if let Some(control) = control {
        let _ = control.await;
    }
    tracing::info!("tabrelay host stopped");
    result
}
