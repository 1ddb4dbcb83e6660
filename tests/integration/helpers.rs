//! Shared fixtures: fake vendors, a recording transport, and a fully
//! wired conversational pipeline.

#![allow(clippy::unwrap_used, dead_code)]

use async_trait::async_trait;
use lyrebird::config::{LlmConfig, SttConfig, TransportConfig, TtsConfig, UserAggregationConfig};
use lyrebird::context::ConversationContext;
use lyrebird::error::Result;
use lyrebird::frames::AudioData;
use lyrebird::llm::{LlmClient, LlmEvent, LlmRequest, LlmService};
use lyrebird::stt::{SttClient, SttConnection, SttEvent};
use lyrebird::transport::{AudioTransport, TransportOutput, WireMessage, WireSerializer};
use lyrebird::tts::{TtsClient, TtsConnection, TtsEvent};
use lyrebird::{PipelineTask, Processor, TaskParams};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

// ── fake STT ────────────────────────────────────────────────────────

/// STT vendor whose transcripts are driven by the test.
#[derive(Default)]
pub struct FakeStt {
    events: Mutex<Option<mpsc::Sender<SttEvent>>>,
}

impl FakeStt {
    pub async fn transcribe_final(&self, text: &str) {
        let sender = self.events.lock().unwrap().clone().unwrap();
        sender.send(SttEvent::Final(text.into())).await.unwrap();
    }

    pub async fn transcribe_interim(&self, text: &str) {
        let sender = self.events.lock().unwrap().clone().unwrap();
        sender.send(SttEvent::Interim(text.into())).await.unwrap();
    }
}

struct FakeSttConnection;

#[async_trait]
impl SttConnection for FakeSttConnection {
    async fn send_audio(&mut self, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl SttClient for FakeStt {
    async fn connect(
        &self,
        _config: &SttConfig,
        events: mpsc::Sender<SttEvent>,
    ) -> Result<Box<dyn SttConnection>> {
        *self.events.lock().unwrap() = Some(events);
        Ok(Box::new(FakeSttConnection))
    }
}

// ── scripted LLM ────────────────────────────────────────────────────

/// LLM vendor that plays back one event script per generation, with a
/// realistic delay before and between events.
pub struct ScriptedLlm {
    scripts: Mutex<VecDeque<Vec<LlmEvent>>>,
    pub delay: Duration,
    pub requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedLlm {
    pub fn new(scripts: Vec<Vec<LlmEvent>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            delay: Duration::from_millis(20),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn text_response(sentences: &[&str]) -> Vec<LlmEvent> {
        let mut events: Vec<LlmEvent> = sentences
            .iter()
            .map(|s| LlmEvent::TextDelta((*s).to_owned()))
            .collect();
        events.push(LlmEvent::Completed);
        events
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn generate(&self, request: LlmRequest, events: mpsc::Sender<LlmEvent>) -> Result<()> {
        self.requests.lock().unwrap().push(request);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| vec![LlmEvent::Completed]);
        for event in script {
            tokio::time::sleep(self.delay).await;
            if events.send(event).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

// ── echo TTS ────────────────────────────────────────────────────────

/// TTS vendor that answers every synthesize call with one µ-law audio
/// chunk tagged with the submitted context id.
#[derive(Default)]
pub struct EchoTts {
    events: Mutex<Option<mpsc::Sender<TtsEvent>>>,
    pub cancelled: Mutex<Vec<String>>,
    pub synthesized: Mutex<Vec<(String, String)>>,
}

impl EchoTts {
    pub fn cancelled_contexts(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }

    pub fn spoken_texts(&self) -> Vec<String> {
        self.synthesized
            .lock()
            .unwrap()
            .iter()
            .map(|(_, text)| text.clone())
            .collect()
    }
}

struct EchoTtsConnection {
    vendor: Arc<EchoTts>,
}

#[async_trait]
impl TtsConnection for EchoTtsConnection {
    async fn synthesize(&mut self, context_id: &str, text: &str, _continues: bool) -> Result<()> {
        self.vendor
            .synthesized
            .lock()
            .unwrap()
            .push((context_id.to_owned(), text.to_owned()));
        let events = self.vendor.events.lock().unwrap().clone().unwrap();
        let _ = events
            .send(TtsEvent::Audio {
                context_id: context_id.to_owned(),
                audio: AudioData {
                    data: vec![0x55; 320],
                    sample_rate: 8_000,
                    channels: 1,
                    codec: lyrebird::frames::AudioCodec::Mulaw,
                },
            })
            .await;
        Ok(())
    }

    async fn flush(&mut self, context_id: &str) -> Result<()> {
        let events = self.vendor.events.lock().unwrap().clone().unwrap();
        let _ = events
            .send(TtsEvent::Flushed {
                context_id: context_id.to_owned(),
            })
            .await;
        Ok(())
    }

    async fn cancel(&mut self, context_id: &str) -> Result<()> {
        self.vendor
            .cancelled
            .lock()
            .unwrap()
            .push(context_id.to_owned());
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct EchoTtsClient {
    pub vendor: Arc<EchoTts>,
}

#[async_trait]
impl TtsClient for EchoTtsClient {
    async fn connect(
        &self,
        _config: &TtsConfig,
        events: mpsc::Sender<TtsEvent>,
    ) -> Result<Box<dyn TtsConnection>> {
        *self.vendor.events.lock().unwrap() = Some(events);
        Ok(Box::new(EchoTtsConnection {
            vendor: Arc::clone(&self.vendor),
        }))
    }
}

// ── recording transport ─────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingTransport {
    pub sent: Mutex<Vec<WireMessage>>,
}

impl RecordingTransport {
    pub fn audio_chunks(&self) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|m| matches!(m, WireMessage::Binary(_)))
            .count()
    }

    pub fn clear_commands(&self) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|m| matches!(m, WireMessage::Text(t) if t.contains("clear")))
            .count()
    }
}

#[async_trait]
impl AudioTransport for RecordingTransport {
    async fn send(&self, message: WireMessage) -> Result<()> {
        self.sent.lock().unwrap().push(message);
        Ok(())
    }
}

pub struct JsonSerializer;

impl WireSerializer for JsonSerializer {
    fn serialize_audio(&self, audio: &AudioData) -> Result<Vec<WireMessage>> {
        Ok(vec![WireMessage::Binary(audio.data.clone())])
    }

    fn serialize_interruption(&self) -> Vec<WireMessage> {
        vec![WireMessage::Text("{\"event\":\"clear\"}".into())]
    }
}

// ── wired session ───────────────────────────────────────────────────

pub struct Session {
    pub task: Option<PipelineTask>,
    pub context: Arc<ConversationContext>,
    pub stt: Arc<FakeStt>,
    pub llm: Arc<ScriptedLlm>,
    pub tts: Arc<EchoTts>,
    pub transport: Arc<RecordingTransport>,
}

/// Wire a full conversational chain:
/// STT → user aggregation → LLM → assistant aggregation → TTS → output.
pub fn conversation_session(scripts: Vec<Vec<LlmEvent>>, params: TaskParams) -> Session {
    conversation_session_with(scripts, params, |_| {})
}

/// Like [`conversation_session`], with a hook to configure the LLM stage
/// (register function handlers) before the chain is sealed.
pub fn conversation_session_with(
    scripts: Vec<Vec<LlmEvent>>,
    params: TaskParams,
    configure_llm: impl FnOnce(&LlmService),
) -> Session {
    init_tracing();
    let context = Arc::new(ConversationContext::new(None, 0.7));
    let stt = Arc::new(FakeStt::default());
    let llm = Arc::new(ScriptedLlm::new(scripts));
    let tts = Arc::new(EchoTts::default());
    let transport = Arc::new(RecordingTransport::default());

    let llm_service = LlmService::new(Arc::clone(&llm) as Arc<dyn LlmClient>, LlmConfig::default());
    configure_llm(&llm_service);

    let stages = vec![
        Processor::new(lyrebird::stt::SttService::new(
            Arc::clone(&stt) as Arc<dyn SttClient>,
            SttConfig::default(),
        )),
        Processor::new(lyrebird::aggregators::UserContextAggregator::new(
            Arc::clone(&context),
            &UserAggregationConfig { timeout_ms: 100 },
        )),
        Processor::new(llm_service),
        Processor::new(lyrebird::aggregators::AssistantContextAggregator::new(
            Arc::clone(&context),
        )),
        Processor::new(lyrebird::tts::TtsService::new(
            Arc::new(EchoTtsClient {
                vendor: Arc::clone(&tts),
            }) as Arc<dyn TtsClient>,
            TtsConfig::default(),
        )),
        Processor::new(TransportOutput::new(
            Arc::clone(&transport) as Arc<dyn AudioTransport>,
            Arc::new(JsonSerializer),
            &TransportConfig {
                speech_quiet_timeout_ms: 80,
            },
        )),
    ];

    Session {
        task: Some(PipelineTask::new(stages, params)),
        context,
        stt,
        llm,
        tts,
        transport,
    }
}

/// Poll until `predicate` holds or the deadline passes.
pub async fn wait_for(deadline: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let end = tokio::time::Instant::now() + deadline;
    while tokio::time::Instant::now() < end {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    predicate()
}
