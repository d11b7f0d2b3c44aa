use std::sync::{Arc, Mutex};

use axum::{extract::State, http::StatusCode, Json};
use serde_json::Value;
use tracing::info;

/// Documents received by the analytics sink, in arrival order.
#[derive(Clone, Default)]
pub struct Received(Arc<Mutex<Vec<Value>>>);

impl Received {
    pub fn documents(&self) -> Vec<Value> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

pub async fn post(State(received): State<Received>, Json(document): Json<Value>) -> StatusCode {
    info!(key = %document["key"], "analytics sink received document");
    metrics::counter!("mock_documents_received_total").increment(1);

    received
        .0
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .push(document);

    StatusCode::ACCEPTED
}

pub async fn list(State(received): State<Received>) -> Json<Vec<Value>> {
    Json(received.documents())
}
