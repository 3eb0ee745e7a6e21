use crate::channel::CommandError;
use crate::session::{LineEntry, SessionHandle, TreeSnapshot};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::{Html, IntoResponse},
    routing::get,
    routing::post,
    Json, Router,
};
use gobanview_core::NodeId;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub session: SessionHandle,
}

type ApiError = (StatusCode, String);

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(dashboard))
        .route("/health", get(health))
        .route("/api/tree", get(tree))
        .route("/api/line", get(current_line))
        .route("/api/line/{id}", get(line))
        .route("/api/command", post(command))
        .with_state(Arc::new(state))
        // The API drives a local engine; only loopback peers may reach it.
        .layer(middleware::from_fn(ip_allowlist))
        // Never `Access-Control-Allow-Origin: *`: any page in the browser could
        // otherwise send commands to the engine.
        .layer(local_only_cors())
}

pub(crate) async fn health() -> &'static str {
    "ok"
}

async fn dashboard() -> Html<&'static str> {
    Html(DASHBOARD_HTML)
}

pub(crate) async fn tree(
    State(state): State<Arc<AppState>>,
) -> Result<Json<TreeSnapshot>, ApiError> {
    state.session.snapshot().await.map(Json).map_err(unavailable)
}

pub(crate) async fn current_line(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<LineEntry>>, ApiError> {
    match state.session.full_line(None).await.map_err(unavailable)? {
        Some(line) => Ok(Json(line)),
        None => Err((StatusCode::NOT_FOUND, "no current position".to_string())),
    }
}

pub(crate) async fn line(
    State(state): State<Arc<AppState>>,
    Path(id): Path<usize>,
) -> Result<Json<Vec<LineEntry>>, ApiError> {
    let node = NodeId::from_index(id);
    match state.session.full_line(Some(node)).await.map_err(unavailable)? {
        Some(line) => Ok(Json(line)),
        None => Err((StatusCode::NOT_FOUND, format!("no node {id}"))),
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct CommandInput {
    pub command: String,
    #[serde(default)]
    pub coalesce: bool,
}

#[derive(Debug, PartialEq, Serialize)]
pub(crate) struct CommandOutput {
    pub ok: bool,
    pub body: String,
    pub superseded: bool,
}

pub(crate) async fn command(
    State(state): State<Arc<AppState>>,
    Json(input): Json<CommandInput>,
) -> Result<Json<CommandOutput>, ApiError> {
    let text = input.command.trim();
    if text.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "empty command".to_string()));
    }
    let result = if input.coalesce {
        state.session.send_coalesced(text).await
    } else {
        state.session.send(text).await
    };
    let output = match result {
        Ok(body) => CommandOutput {
            ok: true,
            body,
            superseded: false,
        },
        Err(CommandError::Rejected(body)) => CommandOutput {
            ok: false,
            body,
            superseded: false,
        },
        Err(CommandError::Superseded) => CommandOutput {
            ok: false,
            body: String::new(),
            superseded: true,
        },
        Err(e @ CommandError::Discarded) => return Err((StatusCode::CONFLICT, e.to_string())),
        Err(e @ CommandError::Disconnected) => {
            return Err((StatusCode::SERVICE_UNAVAILABLE, e.to_string()))
        }
    };
    Ok(Json(output))
}

fn unavailable(e: anyhow::Error) -> ApiError {
    (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
}

pub async fn serve(
    addr: SocketAddr,
    session: SessionHandle,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve_listener(listener, session, shutdown).await
}

pub async fn serve_listener(
    listener: tokio::net::TcpListener,
    session: SessionHandle,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<SocketAddr> {
    let app = build_router(AppState { session });
    let addr = listener.local_addr()?;
    info!(target: "gobanview.viewer", %addr, "viewer listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(addr)
}

async fn ip_allowlist(
    axum::extract::ConnectInfo(peer): axum::extract::ConnectInfo<SocketAddr>,
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let ip = peer.ip();
    if is_allowed_peer_ip(ip) {
        return next.run(req).await;
    }
    (StatusCode::FORBIDDEN, "forbidden").into_response()
}

pub(crate) fn is_allowed_peer_ip(ip: IpAddr) -> bool {
    ip.is_loopback()
}

fn local_only_cors() -> CorsLayer {
    use axum::http::header;
    use axum::http::HeaderValue;
    use axum::http::Method;

    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
        .allow_origin(AllowOrigin::predicate(|origin: &HeaderValue, _req| {
            is_allowed_local_origin(origin)
        }))
}

pub(crate) fn is_allowed_local_origin(origin: &axum::http::HeaderValue) -> bool {
    let Ok(s) = origin.to_str() else {
        return false;
    };
    is_http_origin_for_host(s, "localhost") || is_http_origin_for_host(s, "127.0.0.1")
}

fn is_http_origin_for_host(origin: &str, host: &str) -> bool {
    for scheme in ["http://", "https://"] {
        if let Some(rest) = origin.strip_prefix(scheme) {
            if let Some(after) = rest.strip_prefix(host) {
                // scheme://host[:port] only
                return after.is_empty() || after.starts_with(':');
            }
        }
    }
    false
}

const DASHBOARD_HTML: &str = r###"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8" />
  <title>gobanview</title>
  <style>
    body{margin:0;font-family:system-ui,sans-serif;background:#10151c;color:#e8edf2}
    header{padding:10px 14px;border-bottom:1px solid #2a3440;display:flex;gap:10px;align-items:center}
    #cmd{flex:1;background:#18202a;color:inherit;border:1px solid #2a3440;border-radius:6px;padding:6px 8px}
    #out{font-family:ui-monospace,monospace;font-size:12px;color:#9fb2c4;white-space:pre-wrap;padding:0 14px}
    svg{display:block;margin:14px}
    circle{fill:#3b4a5a}
    circle.main{fill:#d8c27a}
    circle.current{fill:#6fd6ff}
    line{stroke:#3b4a5a;stroke-width:2}
  </style>
</head>
<body>
  <header>
    <strong>gobanview</strong>
    <input id="cmd" placeholder="GTP command, e.g. genmove b" autocomplete="off" />
  </header>
  <div id="out"></div>
  <svg id="tree"></svg>
  <script>
  (function(){
    const CELL = 22;
    const svg = document.getElementById("tree");
    const out = document.getElementById("out");
    const cmd = document.getElementById("cmd");

    async function refresh(){
      try{
        const r = await fetch("/api/tree", { cache: "no-store" });
        if (!r.ok) return;
        const t = await r.json();
        const at = new Map(t.nodes.map(n => [n.id, n]));
        svg.setAttribute("width", Math.max(1, t.surface.width) * CELL + CELL);
        svg.setAttribute("height", Math.max(1, t.surface.height) * CELL + CELL);
        let html = "";
        for (const n of t.nodes){
          const p = at.get(n.parent);
          if (p) html += `<line x1="${p.x*CELL+CELL}" y1="${p.y*CELL+CELL}" x2="${n.x*CELL+CELL}" y2="${n.y*CELL+CELL}"/>`;
        }
        for (const n of t.nodes){
          const cls = n.id === t.current ? "current" : (n.mainLine ? "main" : "");
          html += `<circle class="${cls}" cx="${n.x*CELL+CELL}" cy="${n.y*CELL+CELL}" r="6"><title>${n.move || "root"} (${n.moveNumber})</title></circle>`;
        }
        svg.innerHTML = html;
      }catch(_e){}
    }

    cmd.addEventListener("keydown", async (e) => {
      if (e.key !== "Enter" || !cmd.value.trim()) return;
      const command = cmd.value;
      cmd.value = "";
      const r = await fetch("/api/command", {
        method: "POST",
        headers: { "content-type": "application/json" },
        body: JSON.stringify({ command }),
      });
      const text = r.ok ? (await r.json()).body : await r.text();
      out.textContent = `> ${command}\n${text}`;
    });

    setInterval(refresh, 500);
    refresh();
  })();
  </script>
</body>
</html>
"###;
