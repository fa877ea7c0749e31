//! WebSocket front-end
//!
//! HTTP upgrade at `/ws` plus an unauthenticated `/health`. One upgraded
//! transport gets one [`ConnectionState`], N workers, a ping task, and a
//! read loop enforcing the read deadline. Closing the transport cancels
//! every task derived from it.

use crate::cli::Cli;
use crate::config::GatewayConfig;
use crate::connection::{AdmitError, ConnectionState, FrameWriter, QueryRequest};
use crate::protocol::{decode_client_frame, ClientFrame, ServerFrame, StreamStatus};
use crate::worker::{run_worker, WorkerContext};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::StreamExt;
use rill_resolver::{MetadataStore, Resolver};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Time allowed to read the next message from the peer; advanced on every
/// inbound message, pongs included
const READ_DEADLINE: Duration = Duration::from_secs(60);

/// Ping period; must stay inside the read deadline
const PING_PERIOD: Duration = Duration::from_secs(READ_DEADLINE.as_secs() * 9 / 10);

/// How long teardown waits for each worker to finish its current task
const WORKER_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct AppState {
    config: Arc<GatewayConfig>,
    resolver: Arc<Resolver>,
    root: CancellationToken,
}

/// The gateway server.
pub struct Gateway {
    config: Arc<GatewayConfig>,
    resolver: Arc<Resolver>,
    listener: Option<TcpListener>,
    root: CancellationToken,
}

impl Gateway {
    /// Create a gateway bound to its configured address.
    pub async fn bind(config: GatewayConfig) -> anyhow::Result<Self> {
        let store = MetadataStore::new(&config.supabase_url, &config.supabase_key)?;
        let resolver = Arc::new(Resolver::new(store));

        // Pre-bind the listener so we can report the actual address
        let addr = config.server_address();
        let listener = TcpListener::bind(&addr).await?;

        Ok(Self {
            config: Arc::new(config),
            resolver,
            listener: Some(listener),
            root: CancellationToken::new(),
        })
    }

    /// Get the local address the server is bound to
    ///
    /// Useful for tests where port 0 is used for random port selection.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener
            .as_ref()
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotConnected, "server not bound")
            })
            .and_then(|l| l.local_addr())
    }

    /// Token that shuts the gateway down when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.root.clone()
    }

    /// Serve until the shutdown token fires, then drain gracefully.
    pub async fn serve(mut self) -> anyhow::Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow::anyhow!("server already started"))?;

        info!("gateway listening on {}", listener.local_addr()?);

        let state = AppState {
            config: self.config.clone(),
            resolver: self.resolver.clone(),
            root: self.root.clone(),
        };

        let app = Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .with_state(state);

        let root = self.root.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { root.cancelled().await })
            .await?;

        Ok(())
    }
}

async fn health_handler() -> &'static str {
    "healthy"
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_message_size(state.config.max_frame_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

/// Drive one upgraded transport to completion.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (sink, mut inbound) = socket.split();
    let writer = Arc::new(FrameWriter::new(sink));

    let conn_token = state.root.child_token();
    let (conn_state, queue_rx) = ConnectionState::new(conn_token.clone(), state.config.queue_capacity);
    let queue_rx = Arc::new(tokio::sync::Mutex::new(queue_rx));

    let ctx = Arc::new(WorkerContext {
        state: conn_state.clone(),
        writer: writer.clone(),
        resolver: state.resolver.clone(),
    });

    let mut workers = Vec::with_capacity(state.config.max_workers);
    for _ in 0..state.config.max_workers {
        workers.push(tokio::spawn(run_worker(ctx.clone(), queue_rx.clone())));
    }

    // Liveness pings, serialized through the same write lock as frames
    let ping_writer = writer.clone();
    let ping_token = conn_token.clone();
    let ping_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(PING_PERIOD);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = ping_token.cancelled() => break,
                _ = interval.tick() => {
                    if ping_writer.send_ping().await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    debug!("connection established");

    loop {
        let message = tokio::select! {
            _ = conn_token.cancelled() => break,
            next = tokio::time::timeout(READ_DEADLINE, inbound.next()) => match next {
                Err(_) => {
                    warn!("read deadline exceeded, closing connection");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    debug!("transport read error: {}", e);
                    break;
                }
                Ok(Some(Ok(message))) => message,
            },
        };

        match message {
            Message::Text(text) => {
                if !handle_frame(&ctx, &text).await {
                    break;
                }
            }
            // Pings are answered by the transport layer; both directions
            // advance the read deadline simply by arriving
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Binary(_) => {
                warn!("binary frame on a text protocol, closing connection");
                break;
            }
            Message::Close(_) => break,
        }
    }

    // Teardown: cancel every active task, stop the workers, and give them
    // one shared bounded window to close their drivers
    conn_token.cancel();
    conn_state.cancel_all();
    if tokio::time::timeout(WORKER_GRACE, futures::future::join_all(workers))
        .await
        .is_err()
    {
        warn!("workers did not stop within the teardown grace period");
    }
    ping_task.abort();

    debug!("connection closed");
}

/// Dispatch one inbound frame. Returns false when the transport must close.
async fn handle_frame<S>(ctx: &Arc<WorkerContext<S>>, text: &str) -> bool
where
    S: futures::Sink<Message> + Unpin + Send,
    S::Error: std::fmt::Display,
{
    let frame = match decode_client_frame(text) {
        Ok(frame) => frame,
        Err(violation) => {
            return match violation.stream_id {
                Some(stream_id) => {
                    debug!(stream_id = %stream_id, "protocol violation: {}", violation.message);
                    let frame =
                        ServerFrame::error(stream_id, violation.message, Some("ProtocolError"));
                    ctx.writer.send_frame(&frame).await.is_ok()
                }
                None => {
                    warn!("unrecoverable protocol violation: {}", violation.message);
                    false
                }
            };
        }
    };

    match frame {
        ClientFrame::Query {
            stream_id,
            query_id,
            template_data,
        } => {
            let request = QueryRequest {
                stream_id: stream_id.clone(),
                query_id,
                template_data,
            };
            match ctx.state.admit(request) {
                Ok((task, permit)) => {
                    // queued hits the wire before the task becomes visible
                    // to any worker, so running can never precede it
                    let sent = ctx
                        .writer
                        .send_frame(&ServerFrame::status(&stream_id, StreamStatus::Queued))
                        .await;
                    permit.send(task);
                    if let Err(e) = sent {
                        debug!("failed to report queued status: {}", e);
                    }
                }
                Err(error @ AdmitError::QueueFull) => {
                    let code = error.code();
                    send_quiet(ctx, ServerFrame::error(&stream_id, error.to_string(), Some(code)))
                        .await;
                    send_quiet(ctx, ServerFrame::status(&stream_id, StreamStatus::Failed)).await;
                }
                Err(error) => {
                    let code = error.code();
                    send_quiet(ctx, ServerFrame::error(&stream_id, error.to_string(), Some(code)))
                        .await;
                }
            }
        }
        ClientFrame::Cancel { stream_id } => match ctx.state.cancel_stream(&stream_id) {
            Ok(_) => {
                send_quiet(ctx, ServerFrame::status(&stream_id, StreamStatus::Cancelled)).await;
            }
            Err(error) => {
                let code = error.code();
                send_quiet(ctx, ServerFrame::error(&stream_id, error.to_string(), Some(code)))
                    .await;
            }
        },
    }

    true
}

async fn send_quiet<S>(ctx: &Arc<WorkerContext<S>>, frame: ServerFrame)
where
    S: futures::Sink<Message> + Unpin + Send,
    S::Error: std::fmt::Display,
{
    if let Err(e) = ctx.writer.send_frame(&frame).await {
        debug!("failed to write frame: {}", e);
    }
}

/// Parse CLI arguments, load config, and run the gateway to completion.
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli.into_config()?;

    // Driver factories register once, before any connection is accepted
    rill_driver::registry::register_builtin();

    let gateway = Gateway::bind(config).await?;
    let shutdown = gateway.shutdown_token();

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received, draining connections");
        signal_shutdown.cancel();
    });

    let mut server = tokio::spawn(gateway.serve());

    tokio::select! {
        // Server ended on its own (listener error) before any signal
        result = &mut server => {
            return match result {
                Ok(result) => result,
                Err(e) => Err(anyhow::anyhow!("server task panicked: {e}")),
            };
        }
        _ = shutdown.cancelled() => {}
    }

    // Bounded wait for the graceful drain
    match tokio::time::timeout(Duration::from_secs(30), server).await {
        Ok(Ok(Ok(()))) => info!("gateway shut down gracefully"),
        Ok(Ok(Err(e))) => return Err(e),
        Ok(Err(e)) => anyhow::bail!("server task panicked: {e}"),
        Err(_) => warn!("shutdown timed out, forcing exit"),
    }

    Ok(())
}

/// Wait for shutdown signals (Ctrl+C or SIGTERM)
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}
