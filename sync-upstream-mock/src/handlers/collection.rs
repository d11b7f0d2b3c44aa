use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

/// Records served under one path. Reads and id assignment go through a single lock, so
/// concurrent creates never hand out the same id.
#[derive(Clone, Default)]
pub struct Collection {
    name: &'static str,
    records: Arc<Mutex<Vec<Map<String, Value>>>>,
}

impl Collection {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            records: Arc::default(),
        }
    }

    pub fn with_records(name: &'static str, records: Vec<Value>) -> Self {
        let records = records
            .into_iter()
            .filter_map(|record| match record {
                Value::Object(fields) => Some(fields),
                _ => None,
            })
            .collect();

        Self {
            name,
            records: Arc::new(Mutex::new(records)),
        }
    }

    pub fn list(&self) -> Vec<Value> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.iter().cloned().map(Value::Object).collect()
    }

    /// Store `record` under the next free id, replacing any id it came with.
    pub fn insert(&self, mut record: Map<String, Value>) -> Value {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());

        let next_id = records.iter().filter_map(numeric_id).max().unwrap_or(0) + 1;
        record.insert("id".to_owned(), Value::String(next_id.to_string()));
        records.push(record.clone());

        Value::Object(record)
    }
}

fn numeric_id(record: &Map<String, Value>) -> Option<u64> {
    match record.get("id")? {
        Value::String(id) => id.parse().ok(),
        Value::Number(id) => id.as_u64(),
        _ => None,
    }
}

/// Makes every n-th read fail, to exercise the producer retries.
#[derive(Clone, Default)]
pub struct Faults {
    every: u64,
    reads: Arc<AtomicU64>,
}

impl Faults {
    pub fn every(every: u64) -> Self {
        Self {
            every,
            reads: Arc::default(),
        }
    }

    fn next_read_fails(&self) -> bool {
        let read = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
        self.every > 0 && read % self.every == 0
    }
}

#[derive(Clone)]
pub struct CollectionState {
    pub collection: Collection,
    pub faults: Faults,
}

pub async fn list(
    State(state): State<CollectionState>,
) -> Result<Json<Vec<Value>>, (StatusCode, Json<Value>)> {
    if state.faults.next_read_fails() {
        warn!(collection = state.collection.name, "injecting read failure");
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "temporarily unavailable"})),
        ));
    }

    Ok(Json(state.collection.list()))
}

pub async fn create(
    State(state): State<CollectionState>,
    Json(payload): Json<Value>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let Value::Object(record) = payload else {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "record must be a JSON object"})),
        ));
    };

    let created = state.collection.insert(record);
    debug!(collection = state.collection.name, "created {}", created);
    metrics::counter!("mock_records_created_total", "collection" => state.collection.name)
        .increment(1);

    Ok((StatusCode::CREATED, Json(created)))
}
