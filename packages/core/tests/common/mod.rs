//! Shared test fixtures: entity model and an in-memory remote collaborator

#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use mirrorstore_core::db::{OutboundRequest, RemoteDelegate, RemoteRequest};
use mirrorstore_core::models::{
    raw_record, AttributeKind, ChangedObject, EntityModel, EntitySchema, FetchRequest,
    Identifier, NewObject, RawRecord, RawValue,
};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Install a test subscriber once; `RUST_LOG` controls verbosity
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

pub fn id(raw: &str) -> Identifier {
    Identifier::parse(raw).expect("valid identifier")
}

/// Documents with lines, customers and an invoice subtype
pub fn document_model() -> EntityModel {
    EntityModel::new(vec![
        EntitySchema::new("Document")
            .with_table("documents")
            .with_attribute("number", AttributeKind::String)
            .with_attribute("total", AttributeKind::Decimal)
            .with_attribute("issuedAt", AttributeKind::Date)
            .with_to_many("lines", "Line")
            .with_to_one("customer", "Customer"),
        EntitySchema::new("Invoice")
            .with_superentity("Document")
            .with_attribute("paid", AttributeKind::Boolean),
        EntitySchema::new("Line")
            .with_table("document_lines")
            .with_attribute("quantity", AttributeKind::Integer32)
            .with_attribute("description", AttributeKind::String)
            .with_to_one("document", "Document"),
        EntitySchema::new("Customer")
            .with_table("customers")
            .with_attribute("name", AttributeKind::String),
    ])
    .expect("valid document model")
}

pub fn record(value: Value) -> RawRecord {
    raw_record(value).expect("JSON object")
}

#[derive(Default)]
struct RemoteState {
    records: BTreeMap<Identifier, RawRecord>,
    fetches: Vec<FetchRequest>,
    executions: Vec<String>,
    completions: Vec<String>,
    failing: HashSet<Identifier>,
    dependencies: HashMap<Identifier, Vec<Identifier>>,
    delays: HashMap<Identifier, Duration>,
    fetch_delay: Option<Duration>,
    refuse_identifiers: bool,
}

/// In-memory remote collaborator
///
/// Records are JSON objects keyed by identifier; fetches, executions and
/// completions are logged so tests can assert on call counts and ordering.
#[derive(Clone)]
pub struct InMemoryRemote {
    model: Arc<EntityModel>,
    state: Arc<Mutex<RemoteState>>,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl InMemoryRemote {
    pub fn new(model: EntityModel) -> Self {
        Self {
            model: Arc::new(model),
            state: Arc::new(Mutex::new(RemoteState::default())),
            running: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Store a record; it must carry `classname` and `identifier`
    pub fn put(&self, value: Value) {
        let record = record(value);
        let identifier = match record.get("identifier") {
            Some(RawValue::String(raw)) => id(raw),
            other => panic!("record without identifier: {:?}", other),
        };
        self.state.lock().unwrap().records.insert(identifier, record);
    }

    pub fn remove(&self, identifier: &Identifier) {
        self.state.lock().unwrap().records.remove(identifier);
    }

    pub fn record(&self, identifier: &Identifier) -> Option<RawRecord> {
        self.state.lock().unwrap().records.get(identifier).cloned()
    }

    pub fn fail(&self, identifier: Identifier) {
        self.state.lock().unwrap().failing.insert(identifier);
    }

    pub fn depend(&self, identifier: Identifier, on: Identifier) {
        self.state
            .lock()
            .unwrap()
            .dependencies
            .entry(identifier)
            .or_default()
            .push(on);
    }

    pub fn delay(&self, identifier: Identifier, delay: Duration) {
        self.state.lock().unwrap().delays.insert(identifier, delay);
    }

    /// Hold every fetch for `delay` before answering
    pub fn delay_fetches(&self, delay: Duration) {
        self.state.lock().unwrap().fetch_delay = Some(delay);
    }

    pub fn refuse_identifiers(&self) {
        self.state.lock().unwrap().refuse_identifiers = true;
    }

    pub fn fetches(&self) -> Vec<FetchRequest> {
        self.state.lock().unwrap().fetches.clone()
    }

    /// Write executions in start order, as `"<kind> <identifier>"`
    pub fn executions(&self) -> Vec<String> {
        self.state.lock().unwrap().executions.clone()
    }

    /// Write executions in completion order
    pub fn completions(&self) -> Vec<String> {
        self.state.lock().unwrap().completions.clone()
    }

    /// Highest number of write requests running at the same time
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn write(&self, kind: WriteKind, object: &ChangedObject) -> Option<OutboundRequest> {
        let dependencies = self
            .state
            .lock()
            .unwrap()
            .dependencies
            .get(&object.identifier)
            .cloned()
            .unwrap_or_default();

        let request = WriteRequest {
            remote: self.clone(),
            kind,
            entity: object.entity.clone(),
            identifier: object.identifier.clone(),
            changes: object.changes.to_json(),
        };
        Some(
            dependencies
                .into_iter()
                .fold(OutboundRequest::new(request), OutboundRequest::depends_on),
        )
    }
}

struct FetchAll {
    remote: InMemoryRemote,
    request: FetchRequest,
}

#[async_trait]
impl RemoteRequest for FetchAll {
    async fn execute(&self) -> Result<Vec<RawRecord>> {
        let delay = self.remote.state.lock().unwrap().fetch_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.remote.state.lock().unwrap();
        state.fetches.push(self.request.clone());

        let matches = |record: &RawRecord| match record.get("classname") {
            Some(RawValue::String(entity)) => {
                self.remote.model.is_kind_of(entity, &self.request.entity)
            }
            _ => false,
        };

        let records = if self.request.identifiers.is_empty() {
            state.records.values().filter(|r| matches(r)).cloned().collect()
        } else {
            self.request
                .identifiers
                .iter()
                .filter_map(|identifier| state.records.get(identifier))
                .filter(|r| matches(r))
                .cloned()
                .collect()
        };
        Ok(records)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteKind {
    Insert,
    Update,
    Delete,
}

impl WriteKind {
    fn as_str(&self) -> &'static str {
        match self {
            WriteKind::Insert => "insert",
            WriteKind::Update => "update",
            WriteKind::Delete => "delete",
        }
    }
}

struct WriteRequest {
    remote: InMemoryRemote,
    kind: WriteKind,
    entity: String,
    identifier: Identifier,
    changes: Value,
}

#[async_trait]
impl RemoteRequest for WriteRequest {
    async fn execute(&self) -> Result<Vec<RawRecord>> {
        let label = format!("{} {}", self.kind.as_str(), self.identifier);
        let (delay, failing) = {
            let mut state = self.remote.state.lock().unwrap();
            state.executions.push(label.clone());
            (
                state.delays.get(&self.identifier).copied(),
                state.failing.contains(&self.identifier),
            )
        };

        let running = self.remote.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.remote.peak.fetch_max(running, Ordering::SeqCst);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        } else {
            tokio::task::yield_now().await;
        }
        self.remote.running.fetch_sub(1, Ordering::SeqCst);

        let mut state = self.remote.state.lock().unwrap();
        state.completions.push(label);
        if failing {
            return Err(anyhow!("remote rejected {} {}", self.kind.as_str(), self.identifier));
        }

        match self.kind {
            WriteKind::Delete => {
                state.records.remove(&self.identifier);
                Ok(Vec::new())
            }
            WriteKind::Insert | WriteKind::Update => {
                let previous = state.records.get(&self.identifier);
                let version = previous
                    .and_then(|r| match r.get("version") {
                        Some(RawValue::Number(n)) => n.as_u64(),
                        _ => None,
                    })
                    .unwrap_or(0)
                    + 1;

                let mut stored = previous.cloned().unwrap_or_default();
                if let Some(changes) = raw_record(self.changes.clone()) {
                    stored.extend(changes);
                }
                stored.insert("classname".into(), RawValue::from(self.entity.as_str()));
                stored.insert("identifier".into(), RawValue::from(self.identifier.as_str()));
                stored.insert("version".into(), RawValue::from(json!(version)));

                state.records.insert(self.identifier.clone(), stored.clone());
                Ok(vec![stored])
            }
        }
    }
}

impl RemoteDelegate for InMemoryRemote {
    fn fetch_request(&self, request: &FetchRequest) -> Option<Box<dyn RemoteRequest>> {
        Some(Box::new(FetchAll {
            remote: self.clone(),
            request: request.clone(),
        }))
    }

    fn insert_request(&self, object: &ChangedObject) -> Option<OutboundRequest> {
        self.write(WriteKind::Insert, object)
    }

    fn update_request(&self, object: &ChangedObject) -> Option<OutboundRequest> {
        self.write(WriteKind::Update, object)
    }

    fn delete_request(&self, object: &ChangedObject) -> Option<OutboundRequest> {
        self.write(WriteKind::Delete, object)
    }

    fn identifier_for_object(&self, _object: &NewObject) -> Option<String> {
        if self.state.lock().unwrap().refuse_identifiers {
            return None;
        }
        Some(uuid::Uuid::new_v4().to_string())
    }
}
