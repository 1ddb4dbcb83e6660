//! Barge-in behavior through the whole chain.

#![allow(clippy::unwrap_used)]

use crate::helpers::{ScriptedLlm, conversation_session, wait_for};
use lyrebird::context::Role;
use lyrebird::frames::{Frame, FramePayload};
use lyrebird::interrupt::MinWordsStrategy;
use lyrebird::llm::LlmEvent;
use lyrebird::{SessionEvent, TaskParams};
use std::sync::Arc;
use std::time::Duration;

fn min_words_params(min_words: usize) -> TaskParams {
    TaskParams {
        allow_interruptions: true,
        strategies: vec![Arc::new(MinWordsStrategy::new(min_words))],
    }
}

/// A long scripted answer: many sentences with inter-event delays, so the
/// bot is still mid-response when the user barges in.
fn long_answer() -> Vec<LlmEvent> {
    let mut events = Vec::new();
    for i in 0..30 {
        events.push(LlmEvent::TextDelta(format!("Sentence number {i}. ")));
    }
    events.push(LlmEvent::Completed);
    events
}

#[tokio::test]
async fn strong_barge_in_flushes_and_answers_the_user() {
    let mut session = conversation_session(
        vec![
            long_answer(),
            ScriptedLlm::text_response(&["Sure, go ahead."]),
        ],
        min_words_params(3),
    );
    let task = session.task.take().unwrap();
    let handle = task.handle();
    let mut events = task.events();
    let runner = tokio::spawn(task.run());
    assert_eq!(events.recv().await.unwrap(), SessionEvent::Started);

    // Turn 1: the bot starts a long answer.
    session.stt.transcribe_final("tell me everything").await;
    let transport = Arc::clone(&session.transport);
    assert!(
        wait_for(Duration::from_secs(3), move || transport.audio_chunks() > 0).await,
        "bot never started speaking"
    );

    // The user talks over it with enough words to fire the strategy.
    session.stt.transcribe_final("wait stop now").await;

    // The serializer's clear command reaches the wire.
    let transport = Arc::clone(&session.transport);
    assert!(
        wait_for(Duration::from_secs(3), move || transport.clear_commands() > 0).await,
        "interruption never reached the transport"
    );

    // The vendor-side synthesis context was cancelled.
    let tts = Arc::clone(&session.tts);
    assert!(
        wait_for(Duration::from_secs(2), move || {
            !tts.cancelled_contexts().is_empty()
        })
        .await,
        "vendor context was not cancelled"
    );

    // The interrupting words became a user message and got an answer.
    let context = Arc::clone(&session.context);
    assert!(
        wait_for(Duration::from_secs(3), move || {
            context
                .messages()
                .iter()
                .any(|m| m.content == "Sure, go ahead.")
        })
        .await,
        "follow-up generation never completed"
    );
    let messages = session.context.messages();
    assert!(
        messages
            .iter()
            .any(|m| m.role == Role::User && m.content == "wait stop now")
    );
    // The partial first answer was committed, not left half-written.
    assert!(
        messages
            .iter()
            .any(|m| m.role == Role::Assistant && m.content.contains("Sentence number 0"))
    );

    handle
        .queue_frame(Frame::new(FramePayload::End))
        .await
        .unwrap();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn weak_barge_in_is_swallowed() {
    let mut session = conversation_session(
        vec![long_answer(), ScriptedLlm::text_response(&["Unreached."])],
        min_words_params(3),
    );
    let task = session.task.take().unwrap();
    let handle = task.handle();
    let mut events = task.events();
    let runner = tokio::spawn(task.run());
    assert_eq!(events.recv().await.unwrap(), SessionEvent::Started);

    session.stt.transcribe_final("talk to me").await;
    let transport = Arc::clone(&session.transport);
    assert!(
        wait_for(Duration::from_secs(3), move || transport.audio_chunks() > 0).await
    );

    // One word is not an interruption with min-words = 3.
    session.stt.transcribe_final("hey").await;
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(session.transport.clear_commands(), 0);
    assert!(session.tts.cancelled_contexts().is_empty());
    // Exactly one generation ran; the mumble was dropped.
    assert_eq!(session.llm.request_count(), 1);
    assert!(
        !session
            .context
            .messages()
            .iter()
            .any(|m| m.content == "hey")
    );

    handle
        .queue_frame(Frame::new(FramePayload::End))
        .await
        .unwrap();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn user_enqueued_interruption_flushes_the_chain() {
    let mut session = conversation_session(
        vec![long_answer()],
        TaskParams {
            allow_interruptions: true,
            strategies: Vec::new(),
        },
    );
    let task = session.task.take().unwrap();
    let handle = task.handle();
    let mut events = task.events();
    let runner = tokio::spawn(task.run());
    assert_eq!(events.recv().await.unwrap(), SessionEvent::Started);

    session.stt.transcribe_final("go on").await;
    let transport = Arc::clone(&session.transport);
    assert!(
        wait_for(Duration::from_secs(3), move || transport.audio_chunks() > 0).await
    );

    // Callers can force an interruption directly.
    handle
        .queue_frame(Frame::new(FramePayload::Interruption))
        .await
        .unwrap();
    let transport = Arc::clone(&session.transport);
    assert!(
        wait_for(Duration::from_secs(2), move || transport.clear_commands() > 0).await
    );

    handle
        .queue_frame(Frame::new(FramePayload::End))
        .await
        .unwrap();
    assert_eq!(events.recv().await.unwrap(), SessionEvent::Finished);
    runner.await.unwrap().unwrap();
}
