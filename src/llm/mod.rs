//! LLM service stage.
//!
//! Reacts to `LlmContext` frames (from either direction) by snapshotting
//! the shared conversation and streaming a response through the vendor
//! client: text deltas become `Text` frames bracketed by
//! `LlmResponseStart`/`End`, tool-call requests fan out through the
//! registered [`FunctionHandler`]s, and results flow back as
//! `FunctionCallResult` frames for the assistant aggregator to record.
//! An interruption aborts the in-flight generation.

use crate::config::LlmConfig;
use crate::context::{ConversationContext, Message, ToolDefinition};
use crate::error::Result;
use crate::frames::{Frame, FrameDirection, FramePayload, FunctionCallRequest};
use crate::processor::{FrameHandler, ProcessorContext};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EVENT_CHANNEL_SIZE: usize = 64;

/// One request against the vendor.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    /// Vendor model identifier.
    pub model: String,
    /// Conversation snapshot, system message first.
    pub messages: Vec<Message>,
    /// Sampling temperature.
    pub temperature: f32,
    /// Tools the model may call.
    pub tools: Vec<ToolDefinition>,
    /// Tool-choice directive.
    pub tool_choice: Option<String>,
}

/// Streaming events emitted by a vendor client.
///
/// Tool-call arguments stream as string deltas keyed by call id:
/// `ToolCallStart → ToolCallArgsDelta* → ToolCallEnd`.
#[derive(Debug, Clone)]
pub enum LlmEvent {
    /// A decoded text fragment.
    TextDelta(String),
    /// The model opened a tool call.
    ToolCallStart {
        /// Vendor-assigned call id.
        call_id: String,
        /// Function name.
        function_name: String,
    },
    /// A fragment of the JSON arguments for a call.
    ToolCallArgsDelta {
        /// Call this delta belongs to.
        call_id: String,
        /// Raw JSON fragment.
        delta: String,
    },
    /// The model closed a tool call.
    ToolCallEnd {
        /// Call that ended.
        call_id: String,
    },
    /// Generation finished.
    Completed,
    /// Generation failed.
    Error(String),
}

/// Vendor client seam.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Stream one generation; events flow through `events` until
    /// [`LlmEvent::Completed`] or [`LlmEvent::Error`].
    ///
    /// # Errors
    ///
    /// Returns an LLM error if the request cannot be started.
    async fn generate(&self, request: LlmRequest, events: mpsc::Sender<LlmEvent>) -> Result<()>;
}

/// A registered tool implementation.
#[async_trait]
pub trait FunctionHandler: Send + Sync {
    /// Execute the tool.
    ///
    /// # Errors
    ///
    /// Returns an error if the tool fails; the error text becomes the
    /// tool result.
    async fn call(&self, arguments: serde_json::Value) -> Result<serde_json::Value>;

    /// Whether an interruption should cancel a running call.
    fn cancel_on_interruption(&self) -> bool {
        false
    }
}

/// Accumulates streamed tool-call fragments into complete requests.
#[derive(Default)]
struct ToolCallAccumulator {
    order: Vec<String>,
    names: HashMap<String, String>,
    arguments: HashMap<String, String>,
}

impl ToolCallAccumulator {
    fn start(&mut self, call_id: &str, function_name: &str) {
        if !self.names.contains_key(call_id) {
            self.order.push(call_id.to_owned());
        }
        self.names
            .insert(call_id.to_owned(), function_name.to_owned());
    }

    fn push_delta(&mut self, call_id: &str, delta: &str) {
        self.arguments
            .entry(call_id.to_owned())
            .or_default()
            .push_str(delta);
    }

    fn finish(self) -> Vec<FunctionCallRequest> {
        let Self {
            order,
            names,
            arguments,
        } = self;
        order
            .into_iter()
            .filter_map(|call_id| {
                let function_name = names.get(&call_id)?.clone();
                let raw = arguments.get(&call_id).cloned().unwrap_or_default();
                let arguments = if raw.trim().is_empty() {
                    serde_json::json!({})
                } else {
                    serde_json::from_str(&raw).unwrap_or_else(|e| {
                        warn!(call_id, "malformed tool arguments ({e}), passing raw");
                        serde_json::Value::String(raw)
                    })
                };
                Some(FunctionCallRequest {
                    call_id,
                    function_name,
                    arguments,
                })
            })
            .collect()
    }
}

struct InFlightFunction {
    cancel_on_interruption: bool,
    started_at: std::time::Instant,
    task: tokio::task::JoinHandle<()>,
}

#[derive(Default)]
struct GenerationState {
    cancel: Option<CancellationToken>,
    started_at: Option<std::time::Instant>,
    in_flight: HashMap<String, InFlightFunction>,
}

struct LlmInner {
    client: Arc<dyn LlmClient>,
    config: LlmConfig,
    functions: RwLock<HashMap<String, Arc<dyn FunctionHandler>>>,
    generation: Mutex<GenerationState>,
}

/// Pipeline stage driving a streaming LLM vendor.
pub struct LlmService {
    inner: Arc<LlmInner>,
}

impl LlmService {
    /// Create the stage over a vendor client.
    pub fn new(client: Arc<dyn LlmClient>, config: LlmConfig) -> Self {
        Self {
            inner: Arc::new(LlmInner {
                client,
                config,
                functions: RwLock::new(HashMap::new()),
                generation: Mutex::new(GenerationState::default()),
            }),
        }
    }

    /// Register a tool implementation by function name.
    pub fn register_function(&self, name: impl Into<String>, handler: Arc<dyn FunctionHandler>) {
        write_lock(&self.inner.functions).insert(name.into(), handler);
    }

    fn start_generation(&self, ctx: &ProcessorContext, context: Arc<ConversationContext>) {
        let generation_cancel = {
            let mut generation = lock(&self.inner.generation);
            if let Some(previous) = generation.cancel.take() {
                debug!("superseding in-flight generation");
                previous.cancel();
            }
            let fresh = ctx.cancellation().child_token();
            generation.cancel = Some(fresh.clone());
            generation.started_at = Some(std::time::Instant::now());
            fresh
        };

        let request = LlmRequest {
            model: self.inner.config.model.clone(),
            messages: context.messages(),
            temperature: context.temperature(),
            tools: context.tools().to_vec(),
            tool_choice: context.tool_choice().map(str::to_owned),
        };

        let inner = Arc::clone(&self.inner);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            run_generation(inner, ctx, request, generation_cancel).await;
        });
    }

    /// Abort generation and cancellable tool calls on interruption.
    ///
    /// Only work started before the interruption was decided is aborted:
    /// the same interruption's `LlmContext` may already have started the
    /// follow-up generation, which must survive.
    async fn handle_interruption(&self, ctx: &ProcessorContext, decided_at: std::time::Instant) {
        let (cancel, cancelled_calls) = {
            let mut generation = lock(&self.inner.generation);
            let stale = generation
                .started_at
                .is_some_and(|started| started <= decided_at);
            let cancel = if stale {
                generation.started_at = None;
                generation.cancel.take()
            } else {
                None
            };
            let cancelled: Vec<String> = generation
                .in_flight
                .iter()
                .filter(|(_, call)| call.cancel_on_interruption && call.started_at <= decided_at)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &cancelled {
                if let Some(call) = generation.in_flight.remove(id) {
                    call.task.abort();
                }
            }
            (cancel, cancelled)
        };
        if let Some(cancel) = cancel {
            info!("aborting in-flight generation");
            cancel.cancel();
        }
        for call_id in cancelled_calls {
            let _ = ctx
                .push_downstream(Frame::new(FramePayload::FunctionCallCancel { call_id }))
                .await;
        }
    }
}

#[allow(clippy::too_many_lines)]
async fn run_generation(
    inner: Arc<LlmInner>,
    ctx: ProcessorContext,
    request: LlmRequest,
    cancel: CancellationToken,
) {
    debug!(messages = request.messages.len(), "starting generation");
    if ctx
        .push_downstream(Frame::new(FramePayload::LlmResponseStart))
        .await
        .is_err()
    {
        return;
    }

    let (events_tx, mut events_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
    let client = Arc::clone(&inner.client);
    let generate = tokio::spawn(async move { client.generate(request, events_tx).await });

    let mut accumulator = ToolCallAccumulator::default();
    let mut aborted = false;
    let mut failed = false;
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => {
                aborted = true;
                break;
            }
            event = events_rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        match event {
            LlmEvent::TextDelta(text) => {
                if ctx
                    .push_downstream(Frame::new(FramePayload::Text { text }))
                    .await
                    .is_err()
                {
                    aborted = true;
                    break;
                }
            }
            LlmEvent::ToolCallStart {
                call_id,
                function_name,
            } => accumulator.start(&call_id, &function_name),
            LlmEvent::ToolCallArgsDelta { call_id, delta } => {
                accumulator.push_delta(&call_id, &delta);
            }
            LlmEvent::ToolCallEnd { .. } => {}
            LlmEvent::Completed => break,
            LlmEvent::Error(message) => {
                warn!("generation failed: {message}");
                let _ = ctx.push_error(format!("LLM: {message}"), false).await;
                failed = true;
                break;
            }
        }
    }
    if aborted {
        // The interruption path resets the response bracket downstream;
        // emitting End here would close a bracket nobody holds open.
        generate.abort();
        debug!("generation aborted");
        return;
    }

    // Closing the receiver unblocks a client still trying to send.
    drop(events_rx);
    match generate.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!("generation request failed: {e}");
            let _ = ctx.push_error(format!("LLM: {e}"), false).await;
            failed = true;
        }
        Err(e) => {
            if !e.is_cancelled() {
                warn!("generation task panicked: {e}");
            }
        }
    }

    if !failed {
        let requests = accumulator.finish();
        if !requests.is_empty() {
            dispatch_function_calls(&inner, &ctx, requests).await;
        }
    }

    let _ = ctx
        .push_downstream(Frame::new(FramePayload::LlmResponseEnd))
        .await;
}

async fn dispatch_function_calls(
    inner: &Arc<LlmInner>,
    ctx: &ProcessorContext,
    requests: Vec<FunctionCallRequest>,
) {
    info!(count = requests.len(), "model requested tool calls");
    if ctx
        .push_downstream(Frame::new(FramePayload::FunctionCallsStarted(
            requests.clone(),
        )))
        .await
        .is_err()
    {
        return;
    }

    for request in requests {
        let handler = read_lock(&inner.functions)
            .get(&request.function_name)
            .cloned();
        let Some(handler) = handler else {
            warn!(
                function_name = request.function_name,
                "no handler registered"
            );
            let _ = ctx
                .push_downstream(Frame::new(FramePayload::FunctionCallResult {
                    call_id: request.call_id,
                    function_name: request.function_name.clone(),
                    result: serde_json::json!({
                        "error": format!("unknown function {}", request.function_name)
                    }),
                    run_llm: Some(false),
                }))
                .await;
            continue;
        };

        let cancel_on_interruption = handler.cancel_on_interruption();
        if ctx
            .push_downstream(Frame::new(FramePayload::FunctionCallInProgress {
                call_id: request.call_id.clone(),
                function_name: request.function_name.clone(),
                arguments: request.arguments.clone(),
                cancel_on_interruption,
            }))
            .await
            .is_err()
        {
            return;
        }

        // The task only runs once its in-flight entry is registered, so a
        // fast handler cannot finish before it is tracked.
        let (go_tx, go_rx) = tokio::sync::oneshot::channel::<()>();
        let inner_for_task = Arc::clone(inner);
        let ctx_for_task = ctx.clone();
        let call_id = request.call_id.clone();
        let task = tokio::spawn(async move {
            let _ = go_rx.await;
            let result = match handler.call(request.arguments).await {
                Ok(value) => value,
                Err(e) => serde_json::json!({ "error": e.to_string() }),
            };
            lock(&inner_for_task.generation)
                .in_flight
                .remove(&request.call_id);
            let _ = ctx_for_task
                .push_downstream(Frame::new(FramePayload::FunctionCallResult {
                    call_id: request.call_id,
                    function_name: request.function_name,
                    result,
                    run_llm: None,
                }))
                .await;
        });
        lock(&inner.generation).in_flight.insert(
            call_id,
            InFlightFunction {
                cancel_on_interruption,
                started_at: std::time::Instant::now(),
                task,
            },
        );
        let _ = go_tx.send(());
    }
}

#[async_trait]
impl FrameHandler for LlmService {
    fn name(&self) -> &str {
        "llm"
    }

    async fn handle_frame(
        &self,
        ctx: &ProcessorContext,
        frame: Frame,
        direction: FrameDirection,
    ) -> Result<()> {
        match &frame.payload {
            FramePayload::LlmContext(context) => {
                // Triggered by the user aggregator (downstream) or by a
                // tool-result re-run from the assistant side (upstream).
                self.start_generation(ctx, Arc::clone(context));
                Ok(())
            }
            FramePayload::Interruption => {
                self.handle_interruption(ctx, frame.created_at).await;
                ctx.forward(frame, direction).await
            }
            _ => ctx.forward(frame, direction).await,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
