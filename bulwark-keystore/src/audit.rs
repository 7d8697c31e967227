//! Audit logging: every API request emits exactly one structured record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::identity::Identity;

/// Buffered records per trace subscriber; slow consumers lose the oldest.
const TRACE_BUFFER: usize = 256;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditRequest {
    /// Remote address, if known.
    pub ip: Option<String>,
    pub path: String,
    pub identity: Identity,
    pub enclave: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditResponse {
    pub status: u16,
}

/// One request/response line.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditRecord {
    pub time: DateTime<Utc>,
    pub request: AuditRequest,
    pub response: AuditResponse,
    /// End-to-end handling time in milliseconds.
    #[serde(with = "latency_ms")]
    pub latency: Duration,
}

impl AuditRecord {
    pub fn new(request: AuditRequest, status: u16, latency: Duration) -> Self {
        Self {
            time: Utc::now(),
            request,
            response: AuditResponse { status },
            latency,
        }
    }
}

mod latency_ms {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Where audit records go. Emission must never fail the request.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: &AuditRecord);
}

/// Logs records via the `tracing` crate.
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: &AuditRecord) {
        tracing::info!(
            time = %record.time,
            ip = record.request.ip.as_deref().unwrap_or("-"),
            path = %record.request.path,
            identity = %record.request.identity,
            enclave = %record.request.enclave,
            status = record.response.status,
            latency_ms = record.latency.as_millis() as u64,
            "audit"
        );
    }
}

/// Collects records in memory, for tests.
#[derive(Default)]
pub struct MemoryAuditSink {
    records: parking_lot::Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, record: &AuditRecord) {
        self.records.lock().push(record.clone());
    }
}

// ---------------------------------------------------------------------------
// Fan-out
// ---------------------------------------------------------------------------

/// Fans records out to the configured sinks and to live trace subscribers.
pub struct AuditLog {
    sinks: Vec<Arc<dyn AuditSink>>,
    feed: broadcast::Sender<AuditRecord>,
}

impl AuditLog {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(TRACE_BUFFER);
        Self {
            sinks: Vec::new(),
            feed,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn record(&self, record: AuditRecord) {
        for sink in &self.sinks {
            sink.record(&record);
        }
        // No subscribers is the common case and not an error.
        let _ = self.feed.send(record);
    }

    /// Subscribe to the live trace stream.
    pub fn subscribe(&self) -> broadcast::Receiver<AuditRecord> {
        self.feed.subscribe()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(path: &str, status: u16) -> AuditRecord {
        AuditRecord::new(
            AuditRequest {
                ip: Some("127.0.0.1".into()),
                path: path.into(),
                identity: Identity::unknown(),
                enclave: "default".into(),
            },
            status,
            Duration::from_millis(3),
        )
    }

    #[test]
    fn fan_out_reaches_all_sinks() {
        let a = Arc::new(MemoryAuditSink::new());
        let b = Arc::new(MemoryAuditSink::new());
        let log = AuditLog::new()
            .with_sink(a.clone())
            .with_sink(b.clone());
        log.record(record("/v1/status", 200));
        assert_eq!(a.records().len(), 1);
        assert_eq!(b.records().len(), 1);
    }

    #[tokio::test]
    async fn subscribers_see_records() {
        let log = AuditLog::new();
        let mut rx = log.subscribe();
        log.record(record("/v1/key/create/k", 200));
        let got = rx.recv().await.unwrap();
        assert_eq!(got.request.path, "/v1/key/create/k");
        assert_eq!(got.response.status, 200);
    }

    #[test]
    fn records_serialize_with_millisecond_latency() {
        let json = serde_json::to_value(record("/v1/status", 200)).unwrap();
        assert_eq!(json["latency"], 3);
        assert_eq!(json["request"]["enclave"], "default");
    }
}
