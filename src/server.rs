//! Static HTTP server with a live-reload side channel.
//!
//! Requests are resolved against an ordered list of root directories, first
//! hit wins. Browsers subscribe to [`LIVE_RELOAD_PATH`] as a Server-Sent
//! Events stream; every [`ReloadHub::notify`] pushes one message to each
//! open tab, and the snippet the markup compiler injects reloads the page.

use axum::{
    Router,
    extract::{Request, State},
    http::{HeaderValue, StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::get,
};
use futures::stream::Stream;
use serde::Serialize;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tower_http::trace::TraceLayer;

/// SSE endpoint dev pages subscribe to.
pub const LIVE_RELOAD_PATH: &str = "/__livereload";

/// Payload of one reload message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReloadEvent {
    /// Increments with every notification, starting at 1.
    pub generation: u64,
    /// Stages that were re-run (empty for asset-only changes).
    pub stages: Vec<String>,
}

/// Fan-out of reload notifications to connected browsers.
#[derive(Debug, Clone)]
pub struct ReloadHub {
    tx: broadcast::Sender<ReloadEvent>,
    generation: Arc<AtomicU64>,
}

impl Default for ReloadHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ReloadHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self {
            tx,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReloadEvent> {
        self.tx.subscribe()
    }

    /// Push a reload to every subscriber. Returns how many were reached.
    pub fn notify(&self, stages: Vec<String>) -> usize {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        // No open tab is not an error.
        self.tx.send(ReloadEvent { generation, stages }).unwrap_or(0)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

/// What the router serves.
#[derive(Debug, Clone)]
pub struct ServerContext {
    pub roots: Arc<Vec<PathBuf>>,
    /// `None` disables the live-reload endpoint (`serve dist`).
    pub reload: Option<ReloadHub>,
}

impl ServerContext {
    pub fn new(roots: Vec<PathBuf>, reload: Option<ReloadHub>) -> Self {
        Self {
            roots: Arc::new(roots),
            reload,
        }
    }
}

pub fn create_router(ctx: ServerContext) -> Router {
    let mut app = Router::new();
    if ctx.reload.is_some() {
        app = app.route(LIVE_RELOAD_PATH, get(live_reload));
    }
    app.fallback(serve_static)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

/// Bind `addr` and serve until `shutdown` resolves.
pub async fn serve<F>(addr: SocketAddr, ctx: ServerContext, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Serving {} on http://{}", describe_roots(&ctx.roots), addr);
    axum::serve(listener, create_router(ctx))
        .with_graceful_shutdown(shutdown)
        .await
}

fn describe_roots(roots: &[PathBuf]) -> String {
    roots
        .iter()
        .map(|r| r.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

async fn live_reload(
    State(ctx): State<ServerContext>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    let hub = ctx.reload.ok_or(StatusCode::NOT_FOUND)?;
    let stream = BroadcastStream::new(hub.subscribe())
        .filter_map(|result| result.ok())
        .map(|event: ReloadEvent| {
            let data = serde_json::to_string(&event)
                .unwrap_or_else(|_| format!("{{\"generation\":{}}}", event.generation));
            Ok(Event::default().data(data))
        });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn serve_static(State(ctx): State<ServerContext>, req: Request) -> Response {
    let Some(relative) = request_path(req.uri().path()) else {
        return (StatusCode::FORBIDDEN, "forbidden").into_response();
    };
    let Some(path) = resolve(&ctx.roots, &relative) else {
        return (StatusCode::NOT_FOUND, "not found").into_response();
    };
    let mut response = match ServeFile::new(&path).oneshot(req).await {
        Ok(res) => res.into_response(),
        Err(never) => match never {},
    };
    // Rebuilt files must never come from the browser cache.
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

/// Turn a URL path into a relative filesystem path. `None` for anything
/// trying to climb out of the served roots.
fn request_path(url_path: &str) -> Option<PathBuf> {
    let mut relative = PathBuf::new();
    for segment in url_path.split('/') {
        match segment {
            "" | "." => {}
            ".." => return None,
            s => relative.push(s),
        }
    }
    relative
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
        .then_some(relative)
}

/// First existing file for `relative` across `roots`: the path itself, its
/// `index.html` when it is a directory, or `<path>.html` when it has no
/// extension.
pub fn resolve(roots: &[PathBuf], relative: &Path) -> Option<PathBuf> {
    roots.iter().find_map(|root| {
        let candidate = root.join(relative);
        if candidate.is_file() {
            return Some(candidate);
        }
        if candidate.is_dir() {
            let index = candidate.join("index.html");
            return index.is_file().then_some(index);
        }
        if relative.extension().is_none() && !relative.as_os_str().is_empty() {
            let page = candidate.with_extension("html");
            return page.is_file().then_some(page);
        }
        None
    })
}
