//! Usage analytics and call history.
//!
//! The executor reads usage to enforce `times` and, after a successful call,
//! records one touch and one history entry. Repositories own their locking and
//! increment semantics.

use crate::config::{Payload, RpcShape};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;

/// Aggregated usage of one stub.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StubUsage {
    pub stub_id: String,
    /// Successful executions; the authoritative exhaustion counter
    pub used_count: u64,
    pub first_used_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub total_send_messages: u64,
    pub total_data_responses: u64,
    pub stream_end_events: u64,
    pub error_count: u64,
    pub total_duration_ms: u64,
    pub average_duration_ms: u64,
}

/// One execution reported to analytics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StubTouch {
    pub stub_id: String,
    pub duration_ms: u64,
    pub had_error: bool,
    pub send_count: u64,
    pub data_count: u64,
    pub end_count: u64,
}

/// One served call, kept for inspection and replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub service: String,
    pub method: String,
    pub rpc_shape: RpcShape,
    pub stub_id: String,
    /// Number of requests received, before truncation
    pub request_count: usize,
    pub requests: Vec<Payload>,
    pub duration_ms: u64,
    /// Set when requests were dropped to honor the size limit
    pub is_truncated: bool,
}

impl HistoryRecord {
    /// Build a record, keeping whole request payloads while their serialized
    /// size stays within `size_limit` bytes (0 keeps everything).
    pub fn new(
        service: &str,
        method: &str,
        rpc_shape: RpcShape,
        stub_id: &str,
        requests: &[Payload],
        duration_ms: u64,
        size_limit: usize,
    ) -> Self {
        let (kept, is_truncated) = truncate_requests(requests, size_limit);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            service: service.to_string(),
            method: method.to_string(),
            rpc_shape,
            stub_id: stub_id.to_string(),
            request_count: requests.len(),
            requests: kept,
            duration_ms,
            is_truncated,
        }
    }
}

fn truncate_requests(requests: &[Payload], size_limit: usize) -> (Vec<Payload>, bool) {
    if size_limit == 0 {
        return (requests.to_vec(), false);
    }

    let mut kept = Vec::new();
    let mut used = 0;
    for request in requests {
        let size = serde_json::to_string(request).map(|s| s.len()).unwrap_or_default();
        if used + size > size_limit {
            return (kept, true);
        }
        used += size;
        kept.push(request.clone());
    }
    (kept, false)
}

/// Reads stub usage.
#[async_trait]
pub trait UsageReader: Send + Sync {
    async fn get_by_stub_id(&self, stub_id: &str) -> Option<StubUsage>;
}

/// Records executions.
#[async_trait]
pub trait AnalyticsWriter: Send + Sync {
    async fn touch_stub(&self, touch: StubTouch) -> anyhow::Result<()>;
}

/// Appends served calls.
#[async_trait]
pub trait HistoryWriter: Send + Sync {
    async fn add(&self, record: HistoryRecord) -> anyhow::Result<()>;
}

/// In-memory usage analytics.
#[derive(Debug, Default)]
pub struct InMemoryAnalytics {
    usage: RwLock<HashMap<String, StubUsage>>,
}

impl InMemoryAnalytics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stub's usage, sorted by stub id.
    pub async fn all(&self) -> Vec<StubUsage> {
        let usage = self.usage.read().await;
        let mut all: Vec<_> = usage.values().cloned().collect();
        all.sort_by(|a, b| a.stub_id.cmp(&b.stub_id));
        all
    }

    /// Forget the usage of one stub, making it available again.
    pub async fn reset(&self, stub_id: &str) -> bool {
        self.usage.write().await.remove(stub_id).is_some()
    }

    pub async fn clear(&self) {
        self.usage.write().await.clear();
    }
}

#[async_trait]
impl UsageReader for InMemoryAnalytics {
    async fn get_by_stub_id(&self, stub_id: &str) -> Option<StubUsage> {
        self.usage.read().await.get(stub_id).cloned()
    }
}

#[async_trait]
impl AnalyticsWriter for InMemoryAnalytics {
    async fn touch_stub(&self, touch: StubTouch) -> anyhow::Result<()> {
        let now = Utc::now();
        let mut usage = self.usage.write().await;
        let entry = usage
            .entry(touch.stub_id.clone())
            .or_insert_with(|| StubUsage {
                stub_id: touch.stub_id.clone(),
                ..StubUsage::default()
            });

        entry.used_count += 1;
        entry.first_used_at.get_or_insert(now);
        entry.last_used_at = Some(now);
        entry.total_send_messages += touch.send_count;
        entry.total_data_responses += touch.data_count;
        entry.stream_end_events += touch.end_count;
        if touch.had_error {
            entry.error_count += 1;
        }
        entry.total_duration_ms += touch.duration_ms;
        entry.average_duration_ms = entry.total_duration_ms / entry.used_count;
        Ok(())
    }
}

/// Bounded in-memory call history, oldest records evicted first.
#[derive(Debug)]
pub struct InMemoryHistory {
    limit: usize,
    records: RwLock<VecDeque<HistoryRecord>>,
}

impl InMemoryHistory {
    /// Create a history keeping at most `limit` records (0 = unlimited).
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            records: RwLock::new(VecDeque::new()),
        }
    }

    /// Records in arrival order.
    pub async fn list(&self) -> Vec<HistoryRecord> {
        self.records.read().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    pub async fn clear(&self) {
        self.records.write().await.clear();
    }
}

#[async_trait]
impl HistoryWriter for InMemoryHistory {
    async fn add(&self, record: HistoryRecord) -> anyhow::Result<()> {
        let mut records = self.records.write().await;
        records.push_back(record);
        if self.limit > 0 {
            while records.len() > self.limit {
                records.pop_front();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: serde_json::Value) -> Payload {
        match value {
            serde_json::Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    fn touch(stub_id: &str, duration_ms: u64) -> StubTouch {
        StubTouch {
            stub_id: stub_id.to_string(),
            duration_ms,
            send_count: 2,
            data_count: 1,
            end_count: 1,
            ..StubTouch::default()
        }
    }

    fn record(stub_id: &str) -> HistoryRecord {
        HistoryRecord::new("svc.S", "M", RpcShape::Unary, stub_id, &[], 1, 0)
    }

    #[tokio::test]
    async fn test_touch_accumulates_usage() {
        let analytics = InMemoryAnalytics::new();
        assert!(analytics.get_by_stub_id("a").await.is_none());

        analytics.touch_stub(touch("a", 10)).await.unwrap();
        analytics
            .touch_stub(StubTouch {
                had_error: true,
                ..touch("a", 20)
            })
            .await
            .unwrap();

        let usage = analytics.get_by_stub_id("a").await.unwrap();
        assert_eq!(usage.used_count, 2);
        assert_eq!(usage.total_send_messages, 4);
        assert_eq!(usage.total_data_responses, 2);
        assert_eq!(usage.stream_end_events, 2);
        assert_eq!(usage.error_count, 1);
        assert_eq!(usage.total_duration_ms, 30);
        assert_eq!(usage.average_duration_ms, 15);
        assert!(usage.first_used_at <= usage.last_used_at);
    }

    #[tokio::test]
    async fn test_reset_and_all() {
        let analytics = InMemoryAnalytics::new();
        analytics.touch_stub(touch("b", 1)).await.unwrap();
        analytics.touch_stub(touch("a", 1)).await.unwrap();

        let ids: Vec<_> = analytics.all().await.into_iter().map(|u| u.stub_id).collect();
        assert_eq!(ids, vec!["a", "b"]);

        assert!(analytics.reset("a").await);
        assert!(!analytics.reset("a").await);
        assert!(analytics.get_by_stub_id("a").await.is_none());

        analytics.clear().await;
        assert!(analytics.all().await.is_empty());
    }

    #[tokio::test]
    async fn test_history_evicts_oldest() {
        let history = InMemoryHistory::new(2);
        for id in ["one", "two", "three"] {
            history.add(record(id)).await.unwrap();
        }

        let ids: Vec<_> = history.list().await.into_iter().map(|r| r.stub_id).collect();
        assert_eq!(ids, vec!["two", "three"]);
        assert_eq!(history.len().await, 2);

        history.clear().await;
        assert!(history.is_empty().await);
    }

    #[tokio::test]
    async fn test_history_unlimited() {
        let history = InMemoryHistory::new(0);
        for i in 0..50 {
            history.add(record(&i.to_string())).await.unwrap();
        }
        assert_eq!(history.len().await, 50);
    }

    #[test]
    fn test_record_truncation() {
        // {"n":1} serializes to 7 bytes
        let requests = vec![
            payload(json!({"n": 1})),
            payload(json!({"n": 2})),
            payload(json!({"n": 3})),
        ];

        let full = HistoryRecord::new("s", "m", RpcShape::ClientStream, "id", &requests, 5, 0);
        assert_eq!(full.requests.len(), 3);
        assert!(!full.is_truncated);

        let cut = HistoryRecord::new("s", "m", RpcShape::ClientStream, "id", &requests, 5, 15);
        assert_eq!(cut.requests, requests[..2].to_vec());
        assert_eq!(cut.request_count, 3);
        assert!(cut.is_truncated);

        let exact = HistoryRecord::new("s", "m", RpcShape::ClientStream, "id", &requests, 5, 21);
        assert_eq!(exact.requests.len(), 3);
        assert!(!exact.is_truncated);
    }

    #[test]
    fn test_record_ids_are_unique() {
        assert_ne!(record("a").id, record("a").id);
    }
}
