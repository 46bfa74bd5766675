//! JSON-RPC 2.0 over HTTP POST, plus a health probe.

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::adapters::AdapterRegistry;
use crate::rpc::Dispatcher;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub registry: Arc<AdapterRegistry>,
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/", post(rpc_endpoint))
        .route("/health", get(health))
        .layer(CompressionLayer::new())
        .layer(CorsLayer::very_permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn rpc_endpoint(State(state): State<AppState>, Json(request): Json<Value>) -> Json<Value> {
    let id = request.get("id").cloned().unwrap_or(Value::Null);

    if request.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return Json(error_reply(id, -32600, "expected a JSON-RPC 2.0 request"));
    }
    let Some(method) = request.get("method").and_then(Value::as_str) else {
        return Json(error_reply(id, -32600, "request carries no method"));
    };
    let params = request.get("params").cloned().unwrap_or_else(|| json!({}));

    match state.dispatcher.dispatch(method, &params).await {
        Ok(result) => Json(json!({ "jsonrpc": "2.0", "id": id, "result": result })),
        Err(e) => Json(error_reply(id, e.rpc_code(), &e.to_string())),
    }
}

fn error_reply(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let coins: Vec<Value> = state
        .registry
        .iter()
        .map(|(name, adapter)| {
            json!({
                "coin": name,
                "distinction": adapter.distinction().as_str(),
                "latched": adapter.latch().is_set(),
            })
        })
        .collect();
    Json(json!({ "status": "ok", "coins": coins }))
}

pub async fn run_server(
    app: Router,
    bind_address: &str,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!(address = bind_address, "rpc server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    async fn state() -> AppState {
        let store = Store::in_memory().await.unwrap();
        let outbox = store.outbox();
        outbox.migrate().await.unwrap();
        let registry = Arc::new(AdapterRegistry::new());
        AppState {
            dispatcher: Arc::new(Dispatcher::new(registry.clone(), outbox)),
            registry,
        }
    }

    #[tokio::test]
    async fn envelope_errors_are_reported_in_band() {
        let state = state().await;

        let reply = rpc_endpoint(
            State(state.clone()),
            Json(json!({"id": 1, "method": "getProxyInfo"})),
        )
        .await;
        assert_eq!(reply.0["error"]["code"], -32600);
        assert_eq!(reply.0["id"], 1);

        let reply = rpc_endpoint(
            State(state.clone()),
            Json(json!({"jsonrpc": "2.0", "id": 2, "method": "noSuchMethod", "params": {}})),
        )
        .await;
        assert_eq!(reply.0["error"]["code"], -32601);

        let reply = rpc_endpoint(
            State(state),
            Json(json!({
                "jsonrpc": "2.0",
                "id": 3,
                "method": "getProxyInfo",
                "params": {"coin": "nope"},
            })),
        )
        .await;
        assert_eq!(reply.0["error"]["code"], -32004);
    }
}
