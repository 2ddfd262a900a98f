//! ==============================================================================
//! status.rs - hub status page and json api
//! ==============================================================================
//!
//! purpose:
//!     lets someone on the lan see what the hub currently believes about
//!     every label without attaching a debugger or tailing logs.
//!
//! ```text
//!     GET /      -> html table of labels and values
//!     GET /api   -> {"fields": {label: value}, "last_update": ms}
//! ```
//!
//! relationships:
//!     - uses: registry.rs (RegistryHandle::snapshot)
//!     - used by: main.rs (hub role, when status.enabled)
//!
//! ==============================================================================

use crate::registry::{RegistryHandle, Snapshot};

use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::Html, routing::get, Json, Router};
use tower_http::cors::CorsLayer;

pub fn router(registry: RegistryHandle) -> Router {
    Router::new()
        .route("/", get(page_handler))
        .route("/api", get(api_handler))
        .layer(CorsLayer::permissive())
        .with_state(registry)
}

pub async fn run_server(bind: &str, registry: RegistryHandle) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!("status page live at http://{}", listener.local_addr()?);
    axum::serve(listener, router(registry)).await?;
    Ok(())
}

/// json api endpoint for programmatic access
async fn api_handler(
    State(registry): State<RegistryHandle>,
) -> Result<Json<Snapshot>, StatusCode> {
    registry
        .snapshot()
        .await
        .map(Json)
        .ok_or(StatusCode::SERVICE_UNAVAILABLE)
}

async fn page_handler(State(registry): State<RegistryHandle>) -> Result<Html<String>, StatusCode> {
    let snapshot = registry
        .snapshot()
        .await
        .ok_or(StatusCode::SERVICE_UNAVAILABLE)?;
    Ok(Html(render_page(&snapshot)))
}

fn render_page(snapshot: &Snapshot) -> String {
    let mut rows = String::new();
    for (label, value) in &snapshot.fields {
        rows.push_str(&format!(
            "<tr><td>{}</td><td>{}</td></tr>\n",
            html_escape(label),
            html_escape(value.as_str())
        ));
    }

    format!(
        r#"<!doctype html>
<html>
<head><title>sense hub</title><meta http-equiv="refresh" content="10"></head>
<body style="font-family: system-ui; padding: 2rem; background: #1a1a2e; color: #eee;">
<h1>sense hub</h1>
<table>
<tr><th>label</th><th>value</th></tr>
{}</table>
<p style="color: #888;">last update: {} ms since epoch</p>
</body>
</html>"#,
        rows, snapshot.last_update
    )
}

/// escape html special characters to prevent xss
fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
