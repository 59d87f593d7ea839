//! Stats collection
//!
//! A stats request is answered asynchronously. Each session keeps its
//! outstanding requests keyed by request id so that closing the session can
//! fail every one of them with `SessionClosed` instead of leaving callers
//! waiting forever. Delivered reports count as outstanding until released.

use super::WebRTCError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::oneshot;

pub(crate) fn now_millis() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or(0.0)
}

/// Scope of a stats request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatsTarget {
    Session,
    Sender { mid: String },
    Receiver { mid: String },
}

/// One stats object, keyed by `id` inside a report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: f64,
    #[serde(flatten)]
    pub values: Map<String, Value>,
}

impl StatsRecord {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            timestamp: now_millis(),
            values: Map::new(),
        }
    }

    /// Builder-style field setter
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.values.get(key).and_then(Value::as_u64)
    }
}

/// Immutable stats snapshot. Must be released once; dropping releases too.
#[derive(Debug)]
pub struct StatsReport {
    timestamp: f64,
    records: BTreeMap<String, StatsRecord>,
    outstanding: Arc<AtomicUsize>,
    released: AtomicBool,
}

impl StatsReport {
    fn new(records: Vec<StatsRecord>, outstanding: Arc<AtomicUsize>) -> Self {
        outstanding.fetch_add(1, Ordering::AcqRel);
        Self {
            timestamp: now_millis(),
            records: records.into_iter().map(|r| (r.id.clone(), r)).collect(),
            outstanding,
            released: AtomicBool::new(false),
        }
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn get(&self, id: &str) -> Option<&StatsRecord> {
        self.records.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StatsRecord> {
        self.records.values()
    }

    pub fn of_kind<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a StatsRecord> + 'a {
        self.records.values().filter(move |r| r.kind == kind)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// JSON object keyed by record id
    pub fn to_json(&self) -> Value {
        let map = self
            .records
            .iter()
            .map(|(id, record)| (id.clone(), serde_json::to_value(record).unwrap_or(Value::Null)))
            .collect();
        Value::Object(map)
    }

    /// Release the report. Returns false if it was already released.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        true
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for StatsReport {
    fn drop(&mut self) {
        self.release();
    }
}

type StatsReply = oneshot::Sender<Result<StatsReport, WebRTCError>>;

/// Per-session bookkeeping for in-flight stats requests
pub(crate) struct StatsCollector {
    next_request: u64,
    pending: HashMap<u64, StatsReply>,
    outstanding: Arc<AtomicUsize>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            next_request: 1,
            pending: HashMap::new(),
            outstanding: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn begin(&mut self) -> (u64, PendingStats) {
        let id = self.next_request;
        self.next_request += 1;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        (id, PendingStats { rx })
    }

    /// Deliver a result. Requests already failed by `fail_all` are ignored.
    pub fn complete(&mut self, id: u64, result: Result<Vec<StatsRecord>, WebRTCError>) -> bool {
        let Some(reply) = self.pending.remove(&id) else {
            return false;
        };
        let result = result.map(|records| StatsReport::new(records, self.outstanding.clone()));
        // A dropped PendingStats just discards the report, which releases it
        let _ = reply.send(result);
        true
    }

    pub fn fail_all(&mut self, err: WebRTCError) -> usize {
        let count = self.pending.len();
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(err.clone()));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn outstanding_reports(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }
}

/// Resolves to the requested report
pub struct PendingStats {
    rx: oneshot::Receiver<Result<StatsReport, WebRTCError>>,
}

impl PendingStats {
    /// Already-resolved failure
    pub(crate) fn failed(err: WebRTCError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(err));
        Self { rx }
    }
}

impl Future for PendingStats {
    type Output = Result<StatsReport, WebRTCError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(WebRTCError::SessionClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}
