//! Assistant-side context aggregation.
//!
//! Accumulates streamed LLM text between response brackets, commits the
//! assistant message when the outermost response closes, and maintains
//! the tool-call message lifecycle in the shared context. Nesting is
//! tracked so LLM-then-tool-then-LLM flows commit exactly once.

use crate::context::{ConversationContext, Message};
use crate::error::Result;
use crate::frames::{Frame, FrameDirection, FramePayload};
use crate::processor::{FrameHandler, ProcessorContext};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default)]
struct InFlightCall {
    cancel_on_interruption: bool,
}

#[derive(Default)]
struct AssistantAggState {
    /// Response nesting depth; text only aggregates while positive.
    started: usize,
    aggregation: Vec<String>,
    in_flight: HashMap<String, InFlightCall>,
}

/// Pipeline stage aggregating assistant output into the shared context.
pub struct AssistantContextAggregator {
    context: Arc<ConversationContext>,
    state: Mutex<AssistantAggState>,
}

impl AssistantContextAggregator {
    /// Create the stage over the shared context.
    pub fn new(context: Arc<ConversationContext>) -> Self {
        Self {
            context,
            state: Mutex::new(AssistantAggState::default()),
        }
    }

    /// Commit the aggregation as one assistant message, if non-empty.
    fn commit(&self) -> bool {
        let text = {
            let mut state = lock(&self.state);
            if state.aggregation.is_empty() {
                return false;
            }
            let joined = state.aggregation.join("");
            state.aggregation.clear();
            joined
        };
        self.context.push_message(Message::assistant(text));
        true
    }

    /// Whether an LLM re-run should follow this tool result.
    fn should_rerun(&self, run_llm: Option<bool>) -> bool {
        match run_llm {
            Some(explicit) => explicit,
            None => lock(&self.state).in_flight.is_empty(),
        }
    }
}

#[async_trait]
impl FrameHandler for AssistantContextAggregator {
    fn name(&self) -> &str {
        "assistant-aggregator"
    }

    async fn handle_frame(
        &self,
        ctx: &ProcessorContext,
        frame: Frame,
        direction: FrameDirection,
    ) -> Result<()> {
        match &frame.payload {
            FramePayload::LlmResponseStart => {
                lock(&self.state).started += 1;
                ctx.forward(frame, direction).await
            }
            FramePayload::Text { text } => {
                {
                    let mut state = lock(&self.state);
                    if state.started > 0 {
                        state.aggregation.push(text.clone());
                    }
                }
                ctx.forward(frame, direction).await
            }
            FramePayload::LlmResponseEnd => {
                let closed = {
                    let mut state = lock(&self.state);
                    state.started = state.started.saturating_sub(1);
                    state.started == 0
                };
                ctx.forward(frame, direction).await?;
                if closed {
                    let committed = self.commit();
                    if committed {
                        debug!("assistant message committed");
                    }
                    ctx.push_downstream(Frame::new(FramePayload::LlmContext(Arc::clone(
                        &self.context,
                    ))))
                    .await?;
                }
                Ok(())
            }
            FramePayload::FunctionCallsStarted(calls) => {
                {
                    let mut state = lock(&self.state);
                    for call in calls {
                        state
                            .in_flight
                            .entry(call.call_id.clone())
                            .or_insert_with(InFlightCall::default);
                    }
                }
                ctx.forward(frame, direction).await
            }
            FramePayload::FunctionCallInProgress {
                call_id,
                function_name,
                arguments,
                cancel_on_interruption,
            } => {
                self.context
                    .add_tool_call_in_progress(call_id, function_name, arguments);
                lock(&self.state).in_flight.insert(
                    call_id.clone(),
                    InFlightCall {
                        cancel_on_interruption: *cancel_on_interruption,
                    },
                );
                ctx.forward(frame, direction).await
            }
            FramePayload::FunctionCallResult {
                call_id,
                function_name,
                result,
                run_llm,
            } => {
                let serialized = result.to_string();
                if !self.context.resolve_tool_call(call_id, &serialized) {
                    warn!(call_id, function_name, "result for unknown tool call");
                }
                lock(&self.state).in_flight.remove(call_id);
                let rerun = self.should_rerun(*run_llm);
                let function_name = function_name.clone();
                ctx.forward(frame, direction).await?;
                if rerun {
                    info!(function_name, "tool results complete, re-running LLM");
                    ctx.push_upstream(Frame::new(FramePayload::LlmContext(Arc::clone(
                        &self.context,
                    ))))
                    .await?;
                }
                Ok(())
            }
            FramePayload::FunctionCallCancel { call_id } => {
                let cancellable = lock(&self.state)
                    .in_flight
                    .get(call_id)
                    .is_some_and(|call| call.cancel_on_interruption);
                if cancellable {
                    self.context.cancel_tool_call(call_id);
                    lock(&self.state).in_flight.remove(call_id);
                }
                ctx.forward(frame, direction).await
            }
            FramePayload::Interruption => {
                // Commit what we have, never leave a half-written message.
                let committed = self.commit();
                if committed {
                    info!("interrupted: committed partial assistant message");
                }
                {
                    let mut state = lock(&self.state);
                    state.started = 0;
                    state.aggregation.clear();
                }
                ctx.forward(frame, direction).await
            }
            _ => ctx.forward(frame, direction).await,
        }
    }
}

fn lock(state: &Mutex<AssistantAggState>) -> std::sync::MutexGuard<'_, AssistantAggState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
