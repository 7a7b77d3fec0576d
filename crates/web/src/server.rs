//! Web server implementation

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use creevey_common::Response as SyncResponse;
use creevey_runner::TestRunner;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::hub::ClientSession;

/// HTTP and WebSocket front of a [`TestRunner`]
#[derive(Clone)]
pub struct WebServer {
    runner: Arc<TestRunner>,
}

impl WebServer {
    pub fn new(runner: Arc<TestRunner>) -> Self {
        Self { runner }
    }

    pub fn router(&self) -> Router {
        let report = ServeDir::new(&self.runner.config().report_dir);

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/api/status", get(status_handler))
            .route("/health", get(health_handler))
            .nest_service("/report", report)
            .fallback(not_found_handler)
            .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(&self.runner))
    }

    /// Start the web server
    pub async fn serve(self, addr: SocketAddr) -> anyhow::Result<()> {
        self.serve_with_shutdown(addr, std::future::pending()).await
    }

    /// Serve until `signal` resolves
    pub async fn serve_with_shutdown(
        self,
        addr: SocketAddr,
        signal: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        info!("Creevey server starting on http://{}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, self.router())
            .with_graceful_shutdown(signal)
            .await?;

        Ok(())
    }
}

pub async fn serve(runner: Arc<TestRunner>, addr: SocketAddr) -> anyhow::Result<()> {
    WebServer::new(runner).serve(addr).await
}

async fn status_handler(State(runner): State<Arc<TestRunner>>) -> impl IntoResponse {
    Json(runner.aggregator().snapshot())
}

async fn health_handler(State(runner): State<Arc<TestRunner>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": creevey_common::VERSION,
        "isRunning": runner.is_running(),
        "counts": runner.aggregator().counts(),
    }))
}

async fn not_found_handler() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": "Not found" })),
    )
}

async fn ws_handler(State(runner): State<Arc<TestRunner>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| async move {
        if let Err(e) = handle_socket(socket, runner).await {
            error!("WebSocket error: {}", e);
        }
    })
}

async fn handle_socket(socket: WebSocket, runner: Arc<TestRunner>) -> anyhow::Result<()> {
    let (mut sink, mut stream) = socket.split();
    let (mut session, status) = ClientSession::connect(runner);
    send(&mut sink, &status).await?;
    debug!("Client connected");

    loop {
        tokio::select! {
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if let Some(response) = session.handle_text(&text) {
                        send(&mut sink, &response).await?;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("WebSocket receive failed: {}", e);
                    break;
                }
            },
            update = session.next_update() => match update {
                Some(response) => send(&mut sink, &response).await?,
                None => break,
            },
        }
    }

    debug!("Client disconnected at seq {}", session.seq());
    let _ = sink.close().await;
    Ok(())
}

async fn send(
    sink: &mut SplitSink<WebSocket, Message>,
    response: &SyncResponse,
) -> anyhow::Result<()> {
    let text = serde_json::to_string(response)?;
    sink.send(Message::Text(text)).await?;
    Ok(())
}
