//! The per-stage processing substrate.
//!
//! A [`Processor`] owns two priority-ordered inbound queues (system and
//! data), forward/back links to its neighbours, and a user-supplied
//! [`FrameHandler`]. Two consumer tasks run from `start` to `stop`, one
//! per queue, so system frames are never stuck behind pending data.
//! Handlers therefore see concurrent invocations and must guard their
//! state with a mutex.
//!
//! The substrate also owns the interruption plumbing: it stores the
//! policy carried by `Start`, lets any handler request an interruption
//! upstream, and flushes the data queue after an `Interruption` frame has
//! been handled.

mod queue;

pub use queue::BoundedQueue;

use crate::error::Result;
use crate::frames::{Frame, FrameCategory, FrameDirection, FramePayload};
use crate::interrupt::InterruptStrategy;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

/// Capacity of the preemptive system queue.
pub const SYSTEM_QUEUE_CAPACITY: usize = 100;
/// Capacity of the ordered data queue.
pub const DATA_QUEUE_CAPACITY: usize = 1000;

/// A stage's view of the interruption policy, from the `Start` frame.
#[derive(Debug, Clone, Default)]
pub struct InterruptionSettings {
    /// Master gate.
    pub allow_interruptions: bool,
    /// Ordered strategy list.
    pub strategies: Vec<Arc<dyn InterruptStrategy>>,
}

/// Stage logic plugged into a [`Processor`].
///
/// `handle_frame` is called from both queue consumers; forward frames the
/// stage does not consume with [`ProcessorContext::forward`].
#[async_trait]
pub trait FrameHandler: Send + Sync {
    /// Stage name for logging.
    fn name(&self) -> &str;

    /// Called once when the processor starts, before any frame.
    async fn on_start(&self, _ctx: &ProcessorContext) -> Result<()> {
        Ok(())
    }

    /// Called once when the processor stops.
    async fn on_stop(&self) -> Result<()> {
        Ok(())
    }

    /// Handle one frame travelling in `direction`.
    async fn handle_frame(
        &self,
        ctx: &ProcessorContext,
        frame: Frame,
        direction: FrameDirection,
    ) -> Result<()>;
}

struct QueuedFrame {
    frame: Frame,
    direction: FrameDirection,
}

#[derive(Default)]
struct Links {
    next: Option<Arc<ProcessorInner>>,
    prev: Option<Arc<ProcessorInner>>,
}

struct ProcessorInner {
    name: String,
    handler: Box<dyn FrameHandler>,
    system_queue: BoundedQueue<QueuedFrame>,
    data_queue: BoundedQueue<QueuedFrame>,
    links: RwLock<Links>,
    settings: RwLock<InterruptionSettings>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ProcessorInner {
    async fn enqueue(&self, frame: Frame, direction: FrameDirection) -> Result<()> {
        let queued = QueuedFrame { frame, direction };
        match queued.frame.category() {
            FrameCategory::System => self.system_queue.push(queued, &self.cancel).await,
            FrameCategory::Data | FrameCategory::Control => {
                self.data_queue.push(queued, &self.cancel).await
            }
        }
    }

    fn neighbour(&self, direction: FrameDirection) -> Option<Arc<ProcessorInner>> {
        let links = read_lock(&self.links);
        match direction {
            FrameDirection::Downstream => links.next.clone(),
            FrameDirection::Upstream => links.prev.clone(),
        }
    }
}

/// A single stage of the pipeline.
pub struct Processor {
    inner: Arc<ProcessorInner>,
}

impl Processor {
    /// Wrap a handler into a processor with default queue capacities.
    pub fn new(handler: impl FrameHandler + 'static) -> Self {
        let name = handler.name().to_owned();
        Self {
            inner: Arc::new(ProcessorInner {
                name,
                handler: Box::new(handler),
                system_queue: BoundedQueue::new(SYSTEM_QUEUE_CAPACITY),
                data_queue: BoundedQueue::new(DATA_QUEUE_CAPACITY),
                links: RwLock::new(Links::default()),
                settings: RwLock::new(InterruptionSettings::default()),
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Stage name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Link `next` directly after this processor (sets both directions).
    pub fn link(&self, next: &Processor) {
        write_lock(&self.inner.links).next = Some(Arc::clone(&next.inner));
        write_lock(&next.inner.links).prev = Some(Arc::clone(&self.inner));
    }

    /// Enqueue a frame into this processor's own queues.
    ///
    /// System frames go to the system queue, everything else to the data
    /// queue. Blocks while the target queue is full.
    ///
    /// # Errors
    ///
    /// Fails with `Cancelled` once the processor's context is cancelled.
    pub async fn queue_frame(&self, frame: Frame, direction: FrameDirection) -> Result<()> {
        self.inner.enqueue(frame, direction).await
    }

    /// Start the consumer tasks, deriving cancellation from `parent`.
    ///
    /// # Errors
    ///
    /// Propagates the handler's `on_start` failure.
    pub async fn start(&self, parent: &CancellationToken) -> Result<()> {
        let inner = &self.inner;

        // Tie this processor's token to the session run token.
        {
            let parent = parent.clone();
            let own = inner.cancel.clone();
            let watcher = tokio::spawn(async move {
                tokio::select! {
                    () = parent.cancelled() => own.cancel(),
                    () = own.cancelled() => {}
                }
            });
            lock(&inner.tasks).push(watcher);
        }

        let ctx = ProcessorContext {
            inner: Arc::clone(inner),
        };
        inner.handler.on_start(&ctx).await?;

        for system in [true, false] {
            let inner = Arc::clone(inner);
            let consumer = tokio::spawn(async move {
                run_consumer(inner, system).await;
            });
            lock(&self.inner.tasks).push(consumer);
        }
        trace!(processor = %self.inner.name, "processor started");
        Ok(())
    }

    /// Cancel the processor context, let in-flight handler calls drain,
    /// and join the consumer tasks.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        let tasks = std::mem::take(&mut *lock(&self.inner.tasks));
        for task in tasks {
            let _ = task.await;
        }
        if let Err(e) = self.inner.handler.on_stop().await {
            error!(processor = %self.inner.name, "stop hook failed: {e}");
        }
        trace!(processor = %self.inner.name, "processor stopped");
    }

    /// A context handle for this processor (used by the pipeline ends).
    pub fn context(&self) -> ProcessorContext {
        ProcessorContext {
            inner: Arc::clone(&self.inner),
        }
    }
}

async fn run_consumer(inner: Arc<ProcessorInner>, system: bool) {
    loop {
        let queue = if system {
            &inner.system_queue
        } else {
            &inner.data_queue
        };
        let Ok(queued) = queue.pop(&inner.cancel).await else {
            break;
        };
        dispatch(&inner, queued).await;
    }
}

async fn dispatch(inner: &Arc<ProcessorInner>, queued: QueuedFrame) {
    let QueuedFrame { frame, direction } = queued;

    // Substrate interception: the interruption policy is stored before the
    // handler sees the Start frame.
    if let FramePayload::Start {
        allow_interruptions,
        strategies,
    } = &frame.payload
    {
        let mut settings = write_lock(&inner.settings);
        settings.allow_interruptions = *allow_interruptions;
        settings.strategies = strategies.clone();
    }
    let flush_after = matches!(frame.payload, FramePayload::Interruption);

    let ctx = ProcessorContext {
        inner: Arc::clone(inner),
    };
    if let Err(e) = inner.handler.handle_frame(&ctx, frame, direction).await {
        if e.is_cancelled() {
            debug!(processor = %inner.name, "handler interrupted by shutdown");
        } else {
            // Handler errors are not fatal to the stage; faults the user
            // must see travel upstream as Error frames.
            error!(processor = %inner.name, "frame handler error: {e}");
        }
    }

    if flush_after {
        let drained = inner.data_queue.drain();
        if drained > 0 {
            debug!(processor = %inner.name, drained, "discarded pending data frames on interruption");
        }
    }
}

/// Handle through which a [`FrameHandler`] interacts with its processor.
#[derive(Clone)]
pub struct ProcessorContext {
    inner: Arc<ProcessorInner>,
}

impl ProcessorContext {
    /// The owning processor's name.
    pub fn processor_name(&self) -> &str {
        &self.inner.name
    }

    /// Push a frame to the neighbour in `direction`.
    ///
    /// At the end of the chain the frame is dropped silently; the
    /// pipeline's synthetic source/sink bridge frames to the task before
    /// that can happen.
    ///
    /// # Errors
    ///
    /// Fails with `Cancelled` when the neighbour is shutting down.
    pub async fn forward(&self, frame: Frame, direction: FrameDirection) -> Result<()> {
        match self.inner.neighbour(direction) {
            Some(target) => target.enqueue(frame, direction).await,
            None => {
                trace!(processor = %self.inner.name, frame = %frame, "dropping frame at end of chain");
                Ok(())
            }
        }
    }

    /// Push a frame downstream.
    ///
    /// # Errors
    ///
    /// See [`forward`](Self::forward).
    pub async fn push_downstream(&self, frame: Frame) -> Result<()> {
        self.forward(frame, FrameDirection::Downstream).await
    }

    /// Push a frame upstream.
    ///
    /// # Errors
    ///
    /// See [`forward`](Self::forward).
    pub async fn push_upstream(&self, frame: Frame) -> Result<()> {
        self.forward(frame, FrameDirection::Upstream).await
    }

    /// Signal upstream that this stage wants to interrupt the bot.
    ///
    /// # Errors
    ///
    /// See [`forward`](Self::forward).
    pub async fn request_interruption(&self) -> Result<()> {
        debug!(processor = %self.inner.name, "requesting interruption");
        self.push_upstream(Frame::new(FramePayload::InterruptionTask))
            .await
    }

    /// Report a fault upstream as an `Error` frame.
    ///
    /// # Errors
    ///
    /// See [`forward`](Self::forward).
    pub async fn push_error(&self, message: impl Into<String>, fatal: bool) -> Result<()> {
        self.push_upstream(Frame::new(FramePayload::Error {
            message: message.into(),
            fatal,
        }))
        .await
    }

    /// The interruption policy stored from the `Start` frame.
    pub fn interruption_settings(&self) -> InterruptionSettings {
        read_lock(&self.inner.settings).clone()
    }

    /// Whether interruptions are enabled for this session.
    pub fn interruptions_allowed(&self) -> bool {
        read_lock(&self.inner.settings).allow_interruptions
    }

    /// This processor's cancellation token, for handler-spawned tasks.
    pub fn cancellation(&self) -> CancellationToken {
        self.inner.cancel.clone()
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
