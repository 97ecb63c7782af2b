use bridge::{BridgeHandler, BridgeState};
use bridge_server::{plugin_router, EditorMcpServer, HOST_TOOLS, PLUGIN_CHANNEL_PORT};
use clap::{Parser, Subcommand};
use color_eyre::eyre::Result;
use color_eyre::Help;
use queue::OperationQueue;
use rmcp::ServiceExt;
use router::ToolRegistry;
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing_subscriber::{self, EnvFilter};

mod bridge;
mod bridge_server;
mod error;
mod queue;
mod queue_command;
mod router;

/// MCP bridge that lets an AI assistant drive a connected editor.
/// Tool invocations can run immediately or be staged in an operation
/// queue and executed as one batch.
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the MCP server using stdio transport
    #[command(alias = "stdio")]
    Server {
        /// Port the editor plugin polls for dispatched tool invocations
        #[arg(long, default_value_t = PLUGIN_CHANNEL_PORT)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();
    let port = match args.command {
        Some(Command::Server { port }) => port,
        None => PLUGIN_CHANNEL_PORT,
    };
    run_server(port).await
}

async fn run_server(port: u16) -> Result<()> {
    tracing::debug!("Debug MCP tracing enabled");

    let bridge = BridgeState::shared();
    let mut registry = ToolRegistry::new();
    for tool in HOST_TOOLS {
        registry.register(BridgeHandler::new(tool, Arc::clone(&bridge)));
    }
    let registry = Arc::new(registry);
    let queue = Arc::new(OperationQueue::new(Arc::clone(&registry)));

    let listener = match bind_plugin_listener((Ipv4Addr::new(127, 0, 0, 1), port)).await {
        Ok(BindOutcome::Listener(listener)) => listener,
        Ok(BindOutcome::AddrInUse) => {
            return Err(color_eyre::eyre::eyre!(
                "Plugin channel port {port} is already in use"
            ))
            .suggestion("Another bridge instance may be running; stop it or pass --port");
        }
        Err(err) => {
            tracing::error!(error = %err, "Failed to bind TCP listener");
            return Err(err.into());
        }
    };

    let (close_tx, close_rx) = tokio::sync::oneshot::channel();
    let app = plugin_router(Arc::clone(&bridge));
    tracing::info!("Editor plugin channel listening on {port}");
    let server_handle = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                _ = close_rx.await;
            })
            .await
        {
            tracing::error!(error = %err, "plugin channel server exited");
        }
    });

    let service = EditorMcpServer::new(queue, registry)
        .serve(rmcp::transport::stdio())
        .await
        .inspect_err(|e| {
            tracing::error!("serving error: {:?}", e);
        })?;
    service.waiting().await?;

    close_tx.send(()).ok();
    tracing::info!("Waiting for plugin channel to gracefully shutdown");
    server_handle.await.ok();
    tracing::info!("Bye!");
    Ok(())
}

enum BindOutcome {
    Listener(tokio::net::TcpListener),
    AddrInUse,
}

async fn bind_plugin_listener(addr: (Ipv4Addr, u16)) -> Result<BindOutcome, std::io::Error> {
    match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => Ok(BindOutcome::Listener(listener)),
        Err(err) if err.kind() == io::ErrorKind::AddrInUse => Ok(BindOutcome::AddrInUse),
        Err(err) => Err(err),
    }
}
