//! Normal conversational flow through the whole chain.

#![allow(clippy::unwrap_used)]

use crate::helpers::{ScriptedLlm, conversation_session, wait_for};
use lyrebird::context::Role;
use lyrebird::frames::{Frame, FramePayload};
use lyrebird::llm::LlmEvent;
use lyrebird::{SessionEvent, TaskParams};
use std::time::Duration;

#[tokio::test]
async fn one_turn_reaches_the_wire_and_the_context() {
    let mut session = conversation_session(
        vec![ScriptedLlm::text_response(&["Hi there. ", "How can I help?"])],
        TaskParams::default(),
    );
    let task = session.task.take().unwrap();
    let handle = task.handle();
    let mut events = task.events();
    let runner = tokio::spawn(task.run());
    assert_eq!(events.recv().await.unwrap(), SessionEvent::Started);

    session.stt.transcribe_final("Hello there").await;

    // The bot's answer is synthesized and paced out to the transport.
    let transport = std::sync::Arc::clone(&session.transport);
    assert!(
        wait_for(Duration::from_secs(3), move || transport.audio_chunks() > 0).await,
        "no synthesized audio reached the transport"
    );

    // The shared context holds the full turn.
    let context = std::sync::Arc::clone(&session.context);
    assert!(
        wait_for(Duration::from_secs(2), move || context.message_count() >= 2).await
    );
    let messages = session.context.messages();
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[0].content, "Hello there");
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].content, "Hi there. How can I help?");

    // Both sentences were submitted to the TTS vendor.
    let spoken = session.tts.spoken_texts();
    assert_eq!(spoken, vec!["Hi there.", "How can I help?"]);

    handle
        .queue_frame(Frame::new(FramePayload::End))
        .await
        .unwrap();
    assert_eq!(events.recv().await.unwrap(), SessionEvent::Finished);
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn interim_transcripts_do_not_trigger_generation() {
    let mut session = conversation_session(
        vec![ScriptedLlm::text_response(&["Answer."])],
        TaskParams::default(),
    );
    let task = session.task.take().unwrap();
    let handle = task.handle();
    let mut events = task.events();
    let runner = tokio::spawn(task.run());
    assert_eq!(events.recv().await.unwrap(), SessionEvent::Started);

    session.stt.transcribe_interim("hel").await;
    session.stt.transcribe_interim("hello th").await;
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(session.llm.request_count(), 0);
    assert_eq!(session.context.message_count(), 0);

    session.stt.transcribe_final("hello there").await;
    let llm = std::sync::Arc::clone(&session.llm);
    assert!(wait_for(Duration::from_secs(2), move || llm.request_count() == 1).await);

    handle
        .queue_frame(Frame::new(FramePayload::End))
        .await
        .unwrap();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn tool_call_loop_reruns_the_llm() {
    struct Clock;

    #[async_trait::async_trait]
    impl lyrebird::llm::FunctionHandler for Clock {
        async fn call(
            &self,
            _arguments: serde_json::Value,
        ) -> lyrebird::Result<serde_json::Value> {
            Ok(serde_json::json!({"time": "12:00"}))
        }
    }

    // Generation 1: the model asks for a tool. Generation 2 (triggered by
    // the tool result): it answers in text.
    let mut session2 = crate::helpers::conversation_session_with(
        vec![
            vec![
                LlmEvent::ToolCallStart {
                    call_id: "t1".into(),
                    function_name: "get_time".into(),
                },
                LlmEvent::ToolCallArgsDelta {
                    call_id: "t1".into(),
                    delta: "{}".into(),
                },
                LlmEvent::ToolCallEnd {
                    call_id: "t1".into(),
                },
                LlmEvent::Completed,
            ],
            ScriptedLlm::text_response(&["It is noon."]),
        ],
        TaskParams::default(),
        |service| service.register_function("get_time", std::sync::Arc::new(Clock)),
    );

    let task = session2.task.take().unwrap();
    let handle = task.handle();
    let mut events = task.events();
    let runner = tokio::spawn(task.run());
    assert_eq!(events.recv().await.unwrap(), SessionEvent::Started);

    session2.stt.transcribe_final("what time is it").await;

    let llm = std::sync::Arc::clone(&session2.llm);
    assert!(
        wait_for(Duration::from_secs(3), move || llm.request_count() == 2).await,
        "tool result did not re-run the LLM"
    );
    let context = std::sync::Arc::clone(&session2.context);
    assert!(wait_for(Duration::from_secs(2), move || {
        context.message_count() >= 4
    })
    .await);

    let messages = session2.context.messages();
    lyrebird::context::validate_message_sequence(&messages).unwrap();
    // user, assistant(tool call), tool(result), assistant(answer)
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[1].tool_calls[0].call_id, "t1");
    assert!(messages[2].answers_call("t1"));
    assert!(messages[2].content.contains("12:00"));
    assert_eq!(messages.last().unwrap().content, "It is noon.");

    handle
        .queue_frame(Frame::new(FramePayload::End))
        .await
        .unwrap();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn cancel_shuts_down_immediately() {
    let mut session = conversation_session(Vec::new(), TaskParams::default());
    let task = session.task.take().unwrap();
    let handle = task.handle();
    let mut events = task.events();
    let runner = tokio::spawn(task.run());
    assert_eq!(events.recv().await.unwrap(), SessionEvent::Started);

    handle
        .queue_frame(Frame::new(FramePayload::Cancel))
        .await
        .unwrap();
    assert_eq!(events.recv().await.unwrap(), SessionEvent::Finished);
    runner.await.unwrap().unwrap();

    // The session is gone; further entries fail as cancelled.
    let err = handle
        .queue_frame(Frame::new(FramePayload::End))
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
}
