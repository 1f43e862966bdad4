//! Call orchestration.
//!
//! Routes a call to the best matching stub, executes it and keeps request
//! counters. Transport layers feed calls in through [`MockServer::handle`].

use crate::analytics::{InMemoryAnalytics, InMemoryHistory};
use crate::config::{GlobalSettings, Metadata, MockConfig, Payload, RpcShape, Stub};
use crate::executor::{Aborted, CallContext, Execution, Executor, ResponseWriter, RuntimeHook};
use crate::matcher::{closest_match, find_match, CallQuery};
use crate::store::InMemoryStubStore;
use crate::template::TemplateEngine;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// One incoming call.
#[derive(Debug, Clone)]
pub struct Call {
    pub service: String,
    pub method: String,
    pub shape: RpcShape,
    pub headers: Metadata,
    pub requests: Vec<Payload>,
}

impl Call {
    pub fn new(service: impl Into<String>, method: impl Into<String>, shape: RpcShape) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            shape,
            headers: Metadata::new(),
            requests: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_request(mut self, request: Payload) -> Self {
        self.requests.push(request);
        self
    }

    fn query(&self) -> CallQuery<'_> {
        CallQuery {
            service: &self.service,
            method: &self.method,
            shape: self.shape,
            headers: &self.headers,
            requests: &self.requests,
        }
    }
}

/// No stub accepted the call.
#[derive(Debug, Clone, PartialEq)]
pub struct NotFound {
    pub service: String,
    pub method: String,
    /// Id and similarity score of the closest stub, if any was ranked
    pub closest: Option<(String, f64)>,
}

impl fmt::Display for NotFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no stub matched {}/{}", self.service, self.method)?;
        if let Some((id, score)) = &self.closest {
            write!(f, "; closest stub '{}' (score {:.2})", id, score)?;
        }
        Ok(())
    }
}

impl std::error::Error for NotFound {}

#[derive(Debug, Error)]
pub enum ServeError {
    #[error(transparent)]
    NotFound(#[from] NotFound),
    #[error(transparent)]
    Execution(#[from] Aborted),
}

/// How a routed call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    Served(Execution),
    /// The matched stub reached its `times` limit. Nothing was written and no
    /// other stub is tried.
    Exhausted { stub_id: String },
}

/// Snapshot of the request counters.
///
/// `requests_matched` counts every call that found a stub, including
/// exhausted and aborted ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServerStats {
    pub stubs: usize,
    pub requests_total: u64,
    pub requests_matched: u64,
    pub requests_unmatched: u64,
    pub requests_exhausted: u64,
}

/// gRPC mock server core.
pub struct MockServer {
    settings: GlobalSettings,
    store: Arc<InMemoryStubStore>,
    analytics: Arc<InMemoryAnalytics>,
    history: Arc<InMemoryHistory>,
    executor: Executor,
    /// Total requests processed
    requests_total: AtomicU64,
    /// Requests routed to a stub
    requests_matched: AtomicU64,
    /// Requests without a matching stub
    requests_unmatched: AtomicU64,
    /// Requests whose stub was exhausted
    requests_exhausted: AtomicU64,
}

impl MockServer {
    /// Create a server from a loaded configuration.
    pub fn new(config: MockConfig) -> Self {
        Self::with_hooks(config, Vec::new())
    }

    /// Create a server whose executor notifies `hooks` after each call.
    pub fn with_hooks(config: MockConfig, hooks: Vec<Arc<dyn RuntimeHook>>) -> Self {
        let MockConfig { stubs, settings } = config;

        info!(
            stubs = stubs.len(),
            history_limit = settings.history_limit,
            "gRPC mock server initialized"
        );

        let analytics = Arc::new(InMemoryAnalytics::new());
        let history = Arc::new(InMemoryHistory::new(settings.history_limit));
        let executor = hooks.into_iter().fold(
            Executor::new(Arc::new(TemplateEngine::new()))
                .with_usage(analytics.clone())
                .with_analytics(analytics.clone())
                .with_history(history.clone())
                .with_message_size_limit(settings.message_size_limit),
            Executor::with_hook,
        );

        Self {
            settings,
            store: Arc::new(InMemoryStubStore::with_stubs(stubs)),
            analytics,
            history,
            executor,
            requests_total: AtomicU64::new(0),
            requests_matched: AtomicU64::new(0),
            requests_unmatched: AtomicU64::new(0),
            requests_exhausted: AtomicU64::new(0),
        }
    }

    /// Create a server from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: MockConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(Self::new(config))
    }

    pub fn settings(&self) -> &GlobalSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<InMemoryStubStore> {
        &self.store
    }

    pub fn analytics(&self) -> &InMemoryAnalytics {
        &self.analytics
    }

    pub fn history(&self) -> &InMemoryHistory {
        &self.history
    }

    /// Route `call` to a stub and replay it into `writer`.
    pub async fn handle(
        &self,
        call: &Call,
        ctx: &CallContext,
        writer: &mut dyn ResponseWriter,
    ) -> Result<CallOutcome, ServeError> {
        self.requests_total.fetch_add(1, Ordering::Relaxed);

        let route = self.store.for_route(&call.service, &call.method).await;
        let query = call.query();

        let Some(stub) = find_match(&route, &query) else {
            self.requests_unmatched.fetch_add(1, Ordering::Relaxed);
            // Unknown methods are ranked against the rest of the service
            let service_stubs;
            let pool: &[Arc<Stub>] = if route.is_empty() {
                service_stubs = self.store.for_service(&call.service).await;
                &service_stubs
            } else {
                &route
            };
            let closest = closest_match(pool, &query).map(|c| (c.stub.id.clone(), c.score));

            if self.settings.log_unmatched {
                warn!(
                    service = %call.service,
                    method = %call.method,
                    requests = call.requests.len(),
                    closest = ?closest,
                    "No matching stub found"
                );
            }

            return Err(NotFound {
                service: call.service.clone(),
                method: call.method.clone(),
                closest,
            }
            .into());
        };

        self.requests_matched.fetch_add(1, Ordering::Relaxed);
        let execution = self
            .executor
            .execute(ctx, stub, call.shape, &call.headers, &call.requests, writer)
            .await?;

        if execution.exhausted {
            self.requests_exhausted.fetch_add(1, Ordering::Relaxed);
            if self.settings.log_unmatched {
                warn!(stub_id = %stub.id, times = stub.times, "Stub exhausted");
            }
            return Ok(CallOutcome::Exhausted {
                stub_id: stub.id.clone(),
            });
        }

        if self.settings.log_matches {
            info!(
                stub_id = %stub.id,
                service = %call.service,
                method = %call.method,
                shape = %call.shape,
                sends = execution.sends,
                "Matched stub"
            );
        }

        Ok(CallOutcome::Served(execution))
    }

    pub fn total_requests(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    pub fn total_matched(&self) -> u64 {
        self.requests_matched.load(Ordering::Relaxed)
    }

    pub fn total_unmatched(&self) -> u64 {
        self.requests_unmatched.load(Ordering::Relaxed)
    }

    pub fn total_exhausted(&self) -> u64 {
        self.requests_exhausted.load(Ordering::Relaxed)
    }

    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            stubs: self.store.len().await,
            requests_total: self.total_requests(),
            requests_matched: self.total_matched(),
            requests_unmatched: self.total_unmatched(),
            requests_exhausted: self.total_exhausted(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::UsageReader;
    use crate::config::Status;
    use crate::executor::{ExecuteError, TransportError};
    use async_trait::async_trait;
    use serde_json::{json, Value};

    #[derive(Default)]
    struct CollectWriter {
        sent: Vec<Value>,
        ended: Vec<Status>,
        closed: bool,
    }

    #[async_trait]
    impl ResponseWriter for CollectWriter {
        async fn set_headers(&mut self, _headers: &Metadata) -> Result<(), TransportError> {
            Ok(())
        }

        async fn send(&mut self, message: Payload) -> Result<(), TransportError> {
            if self.closed {
                return Err(TransportError::Closed);
            }
            self.sent.push(Value::Object(message));
            Ok(())
        }

        async fn set_trailers(&mut self, _trailers: &Metadata) -> Result<(), TransportError> {
            Ok(())
        }

        async fn end(&mut self, status: &Status) -> Result<(), TransportError> {
            self.ended.push(status.clone());
            Ok(())
        }
    }

    fn payload(value: Value) -> Payload {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    fn test_server() -> MockServer {
        MockServer::from_yaml(
            r#"
stubs:
  - id: greet-bob
    service: helloworld.Greeter
    method: SayHello
    priority: 10
    input:
      equals: {name: Bob}
    outputs:
      - data: {message: "Hi Bob"}

  - id: greet-any
    service: helloworld.Greeter
    method: SayHello
    outputs:
      - data: {message: "Hello, {{request.name}}"}

  - id: once
    service: helloworld.Greeter
    method: SayOnce
    times: 1
    outputs:
      - data: {message: once}

  - id: admin
    service: admin.Admin
    method: Reset
    headers:
      equals: {authorization: secret}
    input:
      equals: {scope: everything}
    outputs:
      - stream:
          - end: {code: OK, message: reset}

settings:
  history_limit: 10
"#,
        )
        .unwrap()
    }

    async fn call(server: &MockServer, call: Call) -> (Result<CallOutcome, ServeError>, CollectWriter) {
        let mut writer = CollectWriter::default();
        let result = server.handle(&call, &CallContext::new(), &mut writer).await;
        (result, writer)
    }

    #[tokio::test]
    async fn test_priority_wins() {
        let server = test_server();
        let (result, writer) = call(
            &server,
            Call::new("helloworld.Greeter", "SayHello", RpcShape::Unary)
                .with_request(payload(json!({"name": "Bob"}))),
        )
        .await;

        assert!(matches!(result.unwrap(), CallOutcome::Served(e) if e.used));
        assert_eq!(writer.sent, vec![json!({"message": "Hi Bob"})]);
    }

    #[tokio::test]
    async fn test_fallback_stub_renders_template() {
        let server = test_server();
        let (result, writer) = call(
            &server,
            Call::new("helloworld.Greeter", "SayHello", RpcShape::Unary)
                .with_request(payload(json!({"name": "Eve"}))),
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(writer.sent, vec![json!({"message": "Hello, Eve"})]);

        let history = server.history().list().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].stub_id, "greet-any");
    }

    #[tokio::test]
    async fn test_not_found_reports_closest() {
        let server = test_server();
        let (result, writer) = call(
            &server,
            Call::new("admin.Admin", "Reset", RpcShape::Unary)
                .with_header("authorization", "secret")
                .with_request(payload(json!({"scope": "everythin"}))),
        )
        .await;

        let Err(ServeError::NotFound(not_found)) = result else {
            panic!("expected not found");
        };
        let (id, score) = not_found.closest.clone().unwrap();
        assert_eq!(id, "admin");
        assert!(score > 0.8 && score < 1.0);
        assert!(not_found.to_string().contains("closest stub 'admin'"));
        assert!(writer.sent.is_empty());
        assert_eq!(server.total_unmatched(), 1);
    }

    #[tokio::test]
    async fn test_header_matcher() {
        let server = test_server();
        let request = payload(json!({"scope": "everything"}));

        let (result, _) = call(
            &server,
            Call::new("admin.Admin", "Reset", RpcShape::Unary).with_request(request.clone()),
        )
        .await;
        assert!(matches!(result, Err(ServeError::NotFound(_))));

        let (result, writer) = call(
            &server,
            Call::new("admin.Admin", "Reset", RpcShape::Unary)
                .with_header("authorization", "secret")
                .with_request(request),
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(writer.ended, vec![Status::new("OK", "reset")]);
    }

    #[tokio::test]
    async fn test_unknown_method_ranks_service_stubs() {
        let server = test_server();
        let (result, writer) = call(
            &server,
            Call::new("helloworld.Greeter", "SayGoodbye", RpcShape::Unary)
                .with_request(payload(json!({"name": "Bob"}))),
        )
        .await;

        let Err(ServeError::NotFound(not_found)) = result else {
            panic!("expected not found");
        };
        assert_eq!(not_found.closest, Some(("greet-bob".to_string(), 1.0)));
        assert!(writer.sent.is_empty());
        assert_eq!(server.total_unmatched(), 1);
    }

    #[tokio::test]
    async fn test_unknown_route_has_no_closest() {
        let server = test_server();
        let (result, _) = call(&server, Call::new("nope.Nope", "Nothing", RpcShape::Unary)).await;
        let Err(ServeError::NotFound(not_found)) = result else {
            panic!("expected not found");
        };
        assert!(not_found.closest.is_none());
    }

    #[tokio::test]
    async fn test_exhaustion_and_stats() {
        let server = test_server();
        let once = || Call::new("helloworld.Greeter", "SayOnce", RpcShape::Unary);

        let (first, writer) = call(&server, once()).await;
        assert!(matches!(first.unwrap(), CallOutcome::Served(_)));
        assert_eq!(writer.sent.len(), 1);

        let (second, writer) = call(&server, once()).await;
        assert_eq!(
            second.unwrap(),
            CallOutcome::Exhausted {
                stub_id: "once".to_string()
            }
        );
        assert!(writer.sent.is_empty());

        assert_eq!(server.analytics().get_by_stub_id("once").await.unwrap().used_count, 1);
        assert_eq!(
            server.stats().await,
            ServerStats {
                stubs: 4,
                requests_total: 2,
                requests_matched: 2,
                requests_unmatched: 0,
                requests_exhausted: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_transport_failure_surfaces() {
        let server = test_server();
        let mut writer = CollectWriter {
            closed: true,
            ..CollectWriter::default()
        };
        let result = server
            .handle(
                &Call::new("helloworld.Greeter", "SayOnce", RpcShape::Unary),
                &CallContext::new(),
                &mut writer,
            )
            .await;

        let Err(ServeError::Execution(aborted)) = result else {
            panic!("expected aborted execution");
        };
        assert!(!aborted.used);
        assert!(matches!(aborted.error, ExecuteError::Transport(TransportError::Closed)));
        assert!(server.history().is_empty().await);
    }

    #[tokio::test]
    async fn test_store_updates_are_visible() {
        let server = test_server();
        let stub = serde_yaml::from_str(
            "id: new\nservice: svc.New\nmethod: Go\noutputs:\n  - data: {fresh: true}\n",
        )
        .unwrap();
        server.store().upsert(stub).await.unwrap();

        let (result, writer) = call(&server, Call::new("svc.New", "Go", RpcShape::Unary)).await;
        assert!(result.is_ok());
        assert_eq!(writer.sent, vec![json!({"fresh": true})]);
    }
}
