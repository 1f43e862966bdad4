//! Stub execution.
//!
//! Replays a matched stub's output script against a [`ResponseWriter`]:
//! headers, then the first effective output alternative, then trailers.
//! Analytics, history and runtime hooks are only recorded once the whole
//! script has been written successfully.

use crate::analytics::{AnalyticsWriter, HistoryRecord, HistoryWriter, StubTouch, UsageReader};
use crate::config::{Metadata, OutputKind, Payload, RpcShape, SendEach, SequenceItem, Status, StreamStep, Stub};
use crate::matcher::{matches, metadata_payload};
use crate::template::{RenderContext, Renderer};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Failure reported by a [`ResponseWriter`].
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("stream closed by peer")]
    Closed,
    #[error("write rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Why an execution stopped early.
#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("call cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// An execution that stopped on an error.
#[derive(Debug, Error)]
#[error("execution aborted: {error}")]
pub struct Aborted {
    /// Whether any message or status had been written before the failure
    pub used: bool,
    #[source]
    pub error: ExecuteError,
}

/// Sink for one call's response.
#[async_trait]
pub trait ResponseWriter: Send {
    async fn set_headers(&mut self, headers: &Metadata) -> Result<(), TransportError>;
    async fn send(&mut self, message: Payload) -> Result<(), TransportError>;
    async fn set_trailers(&mut self, trailers: &Metadata) -> Result<(), TransportError>;
    async fn end(&mut self, status: &Status) -> Result<(), TransportError>;
}

/// Cancellation and deadline of one call.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Wait for `duration`, returning early if the call is cancelled or its
    /// deadline passes.
    async fn pause(&self, duration: Duration) -> Result<(), ExecuteError> {
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ExecuteError::Cancelled),
            _ = deadline => Err(ExecuteError::DeadlineExceeded),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

/// Outcome of a completed execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Execution {
    /// At least one message or status was written
    pub used: bool,
    /// The stub had reached its `times` limit; nothing was written
    pub exhausted: bool,
    pub sends: u64,
    pub data: u64,
    pub ends: u64,
}

/// Summary of a successful execution, handed to runtime hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionEvent {
    pub stub_id: String,
    pub service: String,
    pub method: String,
    pub shape: RpcShape,
    pub sends: u64,
    pub data: u64,
    pub ends: u64,
    pub duration_ms: u64,
}

/// Observer notified after each successful execution.
#[async_trait]
pub trait RuntimeHook: Send + Sync {
    fn name(&self) -> &str;

    async fn on_execution(&self, event: &ExecutionEvent) -> anyhow::Result<()>;
}

/// Executes stubs. Holds no per-call state; safe to share across calls.
pub struct Executor {
    renderer: Arc<dyn Renderer>,
    usage: Option<Arc<dyn UsageReader>>,
    analytics: Option<Arc<dyn AnalyticsWriter>>,
    history: Option<Arc<dyn HistoryWriter>>,
    hooks: Vec<Arc<dyn RuntimeHook>>,
    message_size_limit: usize,
}

impl Executor {
    pub fn new(renderer: Arc<dyn Renderer>) -> Self {
        Self {
            renderer,
            usage: None,
            analytics: None,
            history: None,
            hooks: Vec::new(),
            message_size_limit: 0,
        }
    }

    /// Usage source for the `times` limit.
    pub fn with_usage(mut self, usage: Arc<dyn UsageReader>) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_analytics(mut self, analytics: Arc<dyn AnalyticsWriter>) -> Self {
        self.analytics = Some(analytics);
        self
    }

    pub fn with_history(mut self, history: Arc<dyn HistoryWriter>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn RuntimeHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Serialized request bytes kept per history record (0 = unlimited).
    pub fn with_message_size_limit(mut self, limit: usize) -> Self {
        self.message_size_limit = limit;
        self
    }

    /// Execute `stub` for one call.
    ///
    /// An exhausted stub returns immediately without touching the writer. On
    /// a writer failure, cancellation or deadline the call stops at once and
    /// nothing is recorded.
    pub async fn execute(
        &self,
        ctx: &CallContext,
        stub: &Stub,
        shape: RpcShape,
        headers: &Metadata,
        requests: &[Payload],
        writer: &mut dyn ResponseWriter,
    ) -> Result<Execution, Aborted> {
        if self.exhausted(stub).await {
            debug!(stub_id = %stub.id, times = stub.times, "Stub exhausted");
            return Ok(Execution {
                exhausted: true,
                ..Execution::default()
            });
        }

        let started = Instant::now();
        let mut run = Run {
            ctx,
            renderer: self.renderer.as_ref(),
            stub,
            headers,
            requests,
            request_time: Utc::now(),
            writer,
            execution: Execution::default(),
        };

        if let Err(error) = run.drive().await {
            warn!(stub_id = %stub.id, error = %error, "Execution aborted");
            return Err(Aborted {
                used: run.execution.used,
                error,
            });
        }

        let execution = run.execution;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.record(stub, shape, requests, &execution, duration_ms).await;
        Ok(execution)
    }

    async fn exhausted(&self, stub: &Stub) -> bool {
        if stub.times == 0 {
            return false;
        }
        let Some(usage) = &self.usage else {
            return false;
        };
        match usage.get_by_stub_id(&stub.id).await {
            Some(usage) => usage.used_count >= u64::from(stub.times),
            None => false,
        }
    }

    async fn record(
        &self,
        stub: &Stub,
        shape: RpcShape,
        requests: &[Payload],
        execution: &Execution,
        duration_ms: u64,
    ) {
        if let Some(analytics) = &self.analytics {
            let touch = StubTouch {
                stub_id: stub.id.clone(),
                duration_ms,
                had_error: false,
                send_count: execution.sends,
                data_count: execution.data,
                end_count: execution.ends,
            };
            if let Err(e) = analytics.touch_stub(touch).await {
                warn!(stub_id = %stub.id, error = %e, "Failed to record stub usage");
            }
        }

        if let Some(history) = &self.history {
            let record = HistoryRecord::new(
                &stub.service,
                &stub.method,
                shape,
                &stub.id,
                requests,
                duration_ms,
                self.message_size_limit,
            );
            if let Err(e) = history.add(record).await {
                warn!(stub_id = %stub.id, error = %e, "Failed to record call history");
            }
        }

        if self.hooks.is_empty() {
            return;
        }
        let event = ExecutionEvent {
            stub_id: stub.id.clone(),
            service: stub.service.clone(),
            method: stub.method.clone(),
            shape,
            sends: execution.sends,
            data: execution.data,
            ends: execution.ends,
            duration_ms,
        };
        for hook in &self.hooks {
            if let Err(e) = hook.on_execution(&event).await {
                warn!(hook = hook.name(), stub_id = %stub.id, error = %e, "Runtime hook failed");
            }
        }
    }
}

/// State of one execution.
struct Run<'a> {
    ctx: &'a CallContext,
    renderer: &'a dyn Renderer,
    stub: &'a Stub,
    headers: &'a Metadata,
    requests: &'a [Payload],
    request_time: DateTime<Utc>,
    writer: &'a mut dyn ResponseWriter,
    execution: Execution,
}

impl Run<'_> {
    async fn drive(&mut self) -> Result<(), ExecuteError> {
        let stub = self.stub;
        self.writer.set_headers(&stub.response_headers).await?;

        for (i, output) in stub.outputs.iter().enumerate() {
            match output.kind() {
                OutputKind::Data(payload) => {
                    self.data(payload).await?;
                    break;
                }
                OutputKind::Stream(steps) => {
                    self.steps(steps).await?;
                    break;
                }
                OutputKind::Sequence(items) => {
                    if self.sequence(items).await? {
                        break;
                    }
                }
                OutputKind::Unrecognized => {
                    warn!(stub_id = %stub.id, output = i, "Skipping unrecognized output");
                }
            }
        }

        self.writer.set_trailers(&stub.response_trailers).await?;
        Ok(())
    }

    fn render(&self, payload: &Payload, request: Option<&Payload>, message_index: usize) -> Payload {
        let ctx = RenderContext {
            stub_id: &self.stub.id,
            request,
            requests: self.requests,
            headers: self.headers,
            message_index,
            request_time: self.request_time,
        };
        self.renderer.render(payload, &ctx)
    }

    fn sent(&self) -> usize {
        usize::try_from(self.execution.sends).unwrap_or(usize::MAX)
    }

    fn effects(&self) -> u64 {
        self.execution.sends + self.execution.data + self.execution.ends
    }

    async fn send(&mut self, message: Payload) -> Result<(), ExecuteError> {
        self.writer.send(message).await?;
        self.execution.used = true;
        Ok(())
    }

    async fn end(&mut self, status: &Status) -> Result<(), ExecuteError> {
        self.writer.end(status).await?;
        self.execution.used = true;
        self.execution.ends += 1;
        Ok(())
    }

    async fn data(&mut self, payload: &Payload) -> Result<(), ExecuteError> {
        let message = self.render(payload, self.requests.first(), self.sent());
        self.send(message).await?;
        self.execution.data += 1;
        Ok(())
    }

    async fn steps(&mut self, steps: &[StreamStep]) -> Result<(), ExecuteError> {
        for step in steps {
            match step {
                StreamStep::Send(payload) => {
                    let message = self.render(payload, self.requests.first(), self.sent());
                    self.send(message).await?;
                    self.execution.sends += 1;
                }
                StreamStep::Delay(duration) => {
                    debug!(stub_id = %self.stub.id, delay_ms = duration.as_millis() as u64, "Applying delay");
                    self.ctx.pause(*duration).await?;
                }
                StreamStep::End(status) => {
                    self.end(status).await?;
                    break;
                }
            }
        }
        Ok(())
    }

    async fn send_each(&mut self, send_each: &SendEach) -> Result<(), ExecuteError> {
        let requests = self.requests;
        for (i, request) in requests.iter().enumerate() {
            let message = self.render(&send_each.message, Some(request), i);
            self.send(message).await?;
            self.execution.sends += 1;

            if let Some(delay) = send_each.delay {
                self.ctx.pause(delay).await?;
            }
        }
        Ok(())
    }

    /// Run every item whose guard accepts the call. Returns whether anything
    /// was written.
    async fn sequence(&mut self, items: &[SequenceItem]) -> Result<bool, ExecuteError> {
        let before = self.effects();
        let candidate = match self.requests.first() {
            Some(request) => request.clone(),
            None => metadata_payload(self.headers),
        };

        for item in items {
            if let Some(guard) = &item.guard {
                if !matches(guard, &candidate) {
                    debug!(stub_id = %self.stub.id, "Sequence guard rejected call");
                    continue;
                }
            }

            self.steps(&item.stream).await?;
            if let Some(send_each) = &item.send_each {
                self.send_each(send_each).await?;
            }
            if let Some(data) = &item.data {
                self.data(data).await?;
                if let Some(status) = &item.status {
                    self.end(status).await?;
                }
            }
        }

        Ok(self.effects() > before)
    }
}
