//! User and assistant halves of the context aggregator.
//!
//! The user half sits between speech input and the model; the assistant half
//! sits after the model. Each appends at most one message per completed turn.
//! Buffers are discarded on Cancel and Interruption, never flushed.
//!
//! The halves built by one [`ContextAggregatorPair`] share a flag that is set
//! from the moment a run is triggered until its response completes or is
//! interrupted. User speech only interrupts while the flag is set.

use crate::context::{ContextHandle, Message};
use crate::frames::{CancelReason, Frame, FrameDirection, FrameKind};
use crate::pipeline::error::ProcessorError;
use crate::pipeline::processor::{Outbox, Processor};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

/// Builds both aggregator halves over one shared context.
#[derive(Debug, Clone)]
pub struct ContextAggregatorPair {
    context: ContextHandle,
    allow_interruptions: bool,
    responding: Arc<AtomicBool>,
}

impl ContextAggregatorPair {
    pub fn new(context: ContextHandle) -> Self {
        Self {
            context,
            allow_interruptions: true,
            responding: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether user speech interrupts a model response.
    pub fn with_interruptions(mut self, allow: bool) -> Self {
        self.allow_interruptions = allow;
        self
    }

    pub fn context(&self) -> &ContextHandle {
        &self.context
    }

    /// True while a triggered run has not yet completed or been interrupted.
    pub fn is_responding(&self) -> bool {
        self.responding.load(Ordering::SeqCst)
    }

    pub fn user(&self) -> UserAggregator {
        UserAggregator::new(self.context.clone())
            .with_interruptions(self.allow_interruptions)
            .with_response_flag(self.responding.clone())
    }

    pub fn assistant(&self) -> AssistantAggregator {
        AssistantAggregator::new(self.context.clone()).with_response_flag(self.responding.clone())
    }
}

/// Collects the user's turn and triggers a model run when it closes.
///
/// A turn with transcribed text commits as a text message. A spoken turn with
/// no text yet commits as an audio-only message so the model still runs;
/// final transcriptions that arrive before the next turn starts are attached
/// to that message instead of opening a new turn.
pub struct UserAggregator {
    context: ContextHandle,
    pending: Vec<String>,
    user_speaking: bool,
    // Turn closed before its final transcription arrived.
    awaiting_transcription: bool,
    allow_interruptions: bool,
    responding: Arc<AtomicBool>,
    // Input audio heard since SpeechStarted.
    heard: Duration,
    sample_rate: u32,
    // Last commit was audio-only; late transcripts belong to it.
    audio_turn_open: bool,
}

impl UserAggregator {
    pub fn new(context: ContextHandle) -> Self {
        Self {
            context,
            pending: Vec::new(),
            user_speaking: false,
            awaiting_transcription: false,
            allow_interruptions: true,
            responding: Arc::new(AtomicBool::new(false)),
            heard: Duration::ZERO,
            sample_rate: crate::defaults::SAMPLE_RATE,
            audio_turn_open: false,
        }
    }

    pub fn with_interruptions(mut self, allow: bool) -> Self {
        self.allow_interruptions = allow;
        self
    }

    pub(crate) fn with_response_flag(mut self, responding: Arc<AtomicBool>) -> Self {
        self.responding = responding;
        self
    }

    /// Text buffered for the current turn, joined.
    pub fn pending_text(&self) -> String {
        self.pending.join(" ")
    }

    fn trigger(&self, out: &mut Outbox) {
        out.push(FrameKind::RunTrigger);
        self.responding.store(true, Ordering::SeqCst);
    }

    fn commit(&mut self, out: &mut Outbox) {
        let text = self.pending_text();
        self.pending.clear();
        self.awaiting_transcription = false;
        self.audio_turn_open = false;
        self.heard = Duration::ZERO;
        debug!(chars = text.len(), "user turn committed");
        self.context.append(Message::user(text));
        self.trigger(out);
    }

    fn commit_audio(&mut self, out: &mut Outbox) {
        let heard = std::mem::take(&mut self.heard);
        self.awaiting_transcription = false;
        self.audio_turn_open = true;
        debug!(
            audio_ms = heard.as_millis() as u64,
            "untranscribed user turn committed"
        );
        self.context.append(Message::user_audio(self.sample_rate, heard));
        self.trigger(out);
    }

    fn close_turn(&mut self, out: &mut Outbox) {
        self.user_speaking = false;
        if !self.pending.is_empty() {
            self.commit(out);
        } else if !self.heard.is_zero() {
            self.commit_audio(out);
        } else {
            self.awaiting_transcription = true;
        }
    }

    fn accept_transcript(&mut self, text: String, out: &mut Outbox) {
        if self.audio_turn_open
            && !self.user_speaking
            && self.context.transcribe_last_user_audio(&text)
        {
            debug!(chars = text.len(), "late transcript attached to audio turn");
            return;
        }
        self.pending.push(text);
        if self.awaiting_transcription && !self.user_speaking {
            self.commit(out);
        }
    }

    fn discard(&mut self) {
        self.pending.clear();
        self.user_speaking = false;
        self.awaiting_transcription = false;
        self.audio_turn_open = false;
        self.heard = Duration::ZERO;
    }
}

#[async_trait]
impl Processor for UserAggregator {
    fn name(&self) -> &str {
        "user_aggregator"
    }

    async fn process(
        &mut self,
        frame: Frame,
        direction: FrameDirection,
        out: &mut Outbox,
    ) -> Result<(), ProcessorError> {
        if direction == FrameDirection::Upstream {
            out.forward(frame, direction);
            return Ok(());
        }

        match frame.kind() {
            FrameKind::InputAudio(chunk) => {
                if self.user_speaking {
                    self.heard += chunk.duration();
                    self.sample_rate = chunk.sample_rate;
                }
                out.forward(frame, direction);
            }
            FrameKind::SpeechStarted => {
                self.user_speaking = true;
                self.awaiting_transcription = false;
                self.audio_turn_open = false;
                self.heard = Duration::ZERO;
                out.forward(frame, direction);
                if self.allow_interruptions && self.responding.swap(false, Ordering::SeqCst) {
                    debug!("user speech interrupts the response");
                    out.push(FrameKind::Interruption);
                }
            }
            FrameKind::SpeechStopped | FrameKind::EndOfTurn => {
                out.forward(frame, direction);
                self.close_turn(out);
            }
            FrameKind::Transcription { text, is_final } => {
                let text = text.trim().to_string();
                let is_final = *is_final;
                out.forward(frame, direction);
                if is_final && !text.is_empty() {
                    self.accept_transcript(text, out);
                }
            }
            FrameKind::RunTrigger => {
                self.audio_turn_open = false;
                if !self.pending.is_empty() {
                    // commit() queues its own trigger
                    self.commit(out);
                } else {
                    out.forward(frame, direction);
                    self.responding.store(true, Ordering::SeqCst);
                }
            }
            FrameKind::AppendMessages(messages) => {
                debug!(count = messages.len(), "appending messages to context");
                self.context.extend(messages.iter().cloned());
            }
            _ => out.forward(frame, direction),
        }
        Ok(())
    }

    async fn on_cancel(&mut self, reason: &CancelReason) {
        if !self.pending.is_empty() {
            debug!(%reason, "discarding pending user turn");
        }
        self.discard();
    }
}

/// Collects the model's streamed reply and commits it on completion.
pub struct AssistantAggregator {
    context: ContextHandle,
    buffer: String,
    in_response: bool,
    response_audio: Duration,
    responding: Arc<AtomicBool>,
}

impl AssistantAggregator {
    pub fn new(context: ContextHandle) -> Self {
        Self {
            context,
            buffer: String::new(),
            in_response: false,
            response_audio: Duration::ZERO,
            responding: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn with_response_flag(mut self, responding: Arc<AtomicBool>) -> Self {
        self.responding = responding;
        self
    }

    pub fn pending_text(&self) -> &str {
        &self.buffer
    }

    pub fn in_response(&self) -> bool {
        self.in_response
    }

    fn discard(&mut self) {
        self.buffer.clear();
        self.in_response = false;
        self.response_audio = Duration::ZERO;
        self.responding.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Processor for AssistantAggregator {
    fn name(&self) -> &str {
        "assistant_aggregator"
    }

    async fn process(
        &mut self,
        frame: Frame,
        direction: FrameDirection,
        out: &mut Outbox,
    ) -> Result<(), ProcessorError> {
        if direction == FrameDirection::Downstream {
            match frame.kind() {
                FrameKind::ResponseStarted => {
                    self.buffer.clear();
                    self.response_audio = Duration::ZERO;
                    self.in_response = true;
                    self.responding.store(true, Ordering::SeqCst);
                }
                FrameKind::TextDelta(text) if self.in_response => self.buffer.push_str(text),
                FrameKind::OutputAudio(chunk) if self.in_response => {
                    self.response_audio += chunk.duration();
                }
                FrameKind::ResponseCompleted => {
                    let text = self.buffer.trim();
                    if self.in_response && !text.is_empty() {
                        debug!(
                            chars = text.len(),
                            audio_ms = self.response_audio.as_millis() as u64,
                            "assistant turn committed"
                        );
                        self.context.append(Message::assistant(text));
                    }
                    self.discard();
                }
                FrameKind::Interruption => {
                    if self.in_response {
                        debug!(chars = self.buffer.len(), "response interrupted, discarding");
                    }
                    self.discard();
                }
                _ => {}
            }
        }
        out.forward(frame, direction);
        Ok(())
    }

    async fn on_end(&mut self, _out: &mut Outbox) -> Result<(), ProcessorError> {
        self.discard();
        Ok(())
    }

    async fn on_cancel(&mut self, _reason: &CancelReason) {
        self.discard();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AudioChunk;
    use crate::context::{Content, ContentPart, Role};
    use crate::pipeline::testing::ProcessorHarness;

    // 20ms at 16kHz
    fn speech_chunk() -> Frame {
        Frame::input_audio(AudioChunk::new(vec![1200; 320], 16000))
    }

    fn texts(context: &ContextHandle) -> Vec<(Role, String)> {
        context
            .snapshot()
            .into_iter()
            .map(|m| (m.role, m.text()))
            .collect()
    }

    #[tokio::test]
    async fn test_user_turn_commits_on_speech_stopped() {
        let context = ContextHandle::new();
        let mut harness = ProcessorHarness::start(UserAggregator::new(context.clone()));

        harness.send(FrameKind::SpeechStarted.into()).await;
        harness.send(Frame::transcription("Hel", false)).await;
        harness.send(Frame::transcription(" Hello ", true)).await;
        harness.send(FrameKind::SpeechStopped.into()).await;
        harness.send(Frame::end()).await;

        // Nothing is in flight, so speech does not interrupt
        let data = harness.collect_downstream().await;
        assert_eq!(
            data,
            vec![
                FrameKind::SpeechStarted,
                FrameKind::Transcription {
                    text: "Hel".to_string(),
                    is_final: false
                },
                FrameKind::Transcription {
                    text: " Hello ".to_string(),
                    is_final: true
                },
                FrameKind::SpeechStopped,
                FrameKind::RunTrigger,
                FrameKind::End,
            ]
        );
        assert_eq!(texts(&context), vec![(Role::User, "Hello".to_string())]);
    }

    #[tokio::test]
    async fn test_late_transcription_commits_on_arrival() {
        let context = ContextHandle::new();
        let mut harness = ProcessorHarness::start(
            UserAggregator::new(context.clone()).with_interruptions(false),
        );

        harness.send(FrameKind::SpeechStarted.into()).await;
        harness.send(FrameKind::SpeechStopped.into()).await;
        harness.send(Frame::transcription("late words", true)).await;
        harness.send(Frame::end()).await;

        let kinds = harness.collect_downstream().await;
        assert_eq!(kinds.last(), Some(&FrameKind::End));
        assert_eq!(
            kinds.iter().filter(|k| **k == FrameKind::RunTrigger).count(),
            1
        );
        assert!(!kinds.contains(&FrameKind::Interruption));
        assert_eq!(texts(&context), vec![(Role::User, "late words".to_string())]);
    }

    #[tokio::test]
    async fn test_untranscribed_speech_commits_audio_turn() {
        let context = ContextHandle::new();
        let mut harness = ProcessorHarness::start(UserAggregator::new(context.clone()));

        // Audio before the turn is confirmed does not count
        harness.send(speech_chunk()).await;
        harness.send(FrameKind::SpeechStarted.into()).await;
        for _ in 0..5 {
            harness.send(speech_chunk()).await;
        }
        harness.send(FrameKind::SpeechStopped.into()).await;
        harness.send(Frame::end()).await;

        let kinds = harness.collect_downstream().await;
        assert_eq!(
            kinds.iter().filter(|k| **k == FrameKind::RunTrigger).count(),
            1
        );
        let stopped = kinds
            .iter()
            .position(|k| *k == FrameKind::SpeechStopped)
            .unwrap();
        assert_eq!(kinds[stopped + 1], FrameKind::RunTrigger);
        assert_eq!(
            context.snapshot(),
            vec![Message::user_audio(16000, Duration::from_millis(100))]
        );
    }

    #[tokio::test]
    async fn test_late_transcript_attaches_to_audio_turn() {
        let context = ContextHandle::new();
        let mut harness = ProcessorHarness::start(UserAggregator::new(context.clone()));

        harness.send(FrameKind::SpeechStarted.into()).await;
        for _ in 0..3 {
            harness.send(speech_chunk()).await;
        }
        harness.send(FrameKind::SpeechStopped.into()).await;
        harness.send(Frame::transcription("do beagles", true)).await;
        harness.send(Frame::transcription("shed?", true)).await;
        harness.send(Frame::end()).await;

        let kinds = harness.collect_downstream().await;
        // The transcript completes the turn that already ran
        assert_eq!(
            kinds.iter().filter(|k| **k == FrameKind::RunTrigger).count(),
            1
        );
        let messages = context.snapshot();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text(), "do beagles shed?");
        assert_eq!(
            messages[0].content,
            Content::Parts(vec![
                ContentPart::Audio {
                    sample_rate: 16000,
                    duration_ms: 60,
                },
                ContentPart::Text {
                    text: "do beagles".to_string(),
                },
                ContentPart::Text {
                    text: "shed?".to_string(),
                },
            ])
        );
    }

    #[tokio::test]
    async fn test_next_turn_closes_the_transcript_window() {
        let context = ContextHandle::new();
        let mut harness = ProcessorHarness::start(
            UserAggregator::new(context.clone()).with_interruptions(false),
        );

        harness.send(FrameKind::SpeechStarted.into()).await;
        harness.send(speech_chunk()).await;
        harness.send(FrameKind::SpeechStopped.into()).await;
        harness.send(FrameKind::SpeechStarted.into()).await;
        harness.send(speech_chunk()).await;
        harness.send(Frame::transcription("second thought", true)).await;
        harness.send(FrameKind::SpeechStopped.into()).await;
        harness.send(Frame::end()).await;

        let kinds = harness.collect_downstream().await;
        assert_eq!(
            kinds.iter().filter(|k| **k == FrameKind::RunTrigger).count(),
            2
        );
        let messages = context.snapshot();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].is_untranscribed_audio());
        assert_eq!(messages[1], Message::user("second thought"));
    }

    #[tokio::test]
    async fn test_multiple_transcriptions_join_into_one_message() {
        let context = ContextHandle::new();
        let mut harness = ProcessorHarness::start(UserAggregator::new(context.clone()));

        harness.send(Frame::transcription("first part", true)).await;
        harness.send(Frame::transcription("second part", true)).await;
        harness.send(FrameKind::EndOfTurn.into()).await;
        harness.send(Frame::end()).await;
        harness.collect_downstream().await;

        assert_eq!(
            texts(&context),
            vec![(Role::User, "first part second part".to_string())]
        );
    }

    #[tokio::test]
    async fn test_run_trigger_commits_pending_once() {
        let context = ContextHandle::new();
        let mut harness = ProcessorHarness::start(UserAggregator::new(context.clone()));

        harness.send(Frame::transcription("typed", true)).await;
        harness.send(Frame::run_trigger()).await;
        harness.send(Frame::run_trigger()).await;
        harness.send(Frame::end()).await;

        let kinds = harness.collect_downstream().await;
        assert_eq!(
            kinds,
            vec![
                FrameKind::Transcription {
                    text: "typed".to_string(),
                    is_final: true
                },
                FrameKind::RunTrigger,
                FrameKind::RunTrigger,
                FrameKind::End,
            ]
        );
        assert_eq!(context.len(), 1);
    }

    #[tokio::test]
    async fn test_append_messages_seeds_context() {
        let context = ContextHandle::new();
        let mut harness = ProcessorHarness::start(UserAggregator::new(context.clone()));

        harness
            .send(Frame::append_messages(vec![Message::user(
                "Say hello and introduce yourself.",
            )]))
            .await;
        harness.send(Frame::run_trigger()).await;
        harness.send(Frame::end()).await;

        let kinds = harness.collect_downstream().await;
        assert_eq!(kinds, vec![FrameKind::RunTrigger, FrameKind::End]);
        assert_eq!(context.len(), 1);
    }

    #[tokio::test]
    async fn test_user_cancel_discards_pending() {
        let context = ContextHandle::new();
        let mut harness = ProcessorHarness::start(UserAggregator::new(context.clone()));

        harness.send(Frame::transcription("half a thought", true)).await;
        harness.send(Frame::cancel(CancelReason::Requested)).await;
        harness.collect_downstream().await;
        harness.join().await;

        assert!(context.is_empty());
    }

    #[tokio::test]
    async fn test_assistant_commits_on_completion() {
        let context = ContextHandle::new();
        let mut harness = ProcessorHarness::start(AssistantAggregator::new(context.clone()));

        harness.send(FrameKind::ResponseStarted.into()).await;
        harness.send(Frame::text_delta("Hi")).await;
        harness.send(Frame::text_delta(" there")).await;
        harness.send(FrameKind::ResponseCompleted.into()).await;
        harness.send(Frame::end()).await;

        let kinds = harness.collect_downstream().await;
        assert_eq!(kinds.len(), 5);
        assert_eq!(texts(&context), vec![(Role::Assistant, "Hi there".to_string())]);
    }

    #[tokio::test]
    async fn test_assistant_ignores_deltas_outside_response() {
        let context = ContextHandle::new();
        let mut harness = ProcessorHarness::start(AssistantAggregator::new(context.clone()));

        harness.send(Frame::text_delta("stray")).await;
        harness.send(FrameKind::ResponseCompleted.into()).await;
        harness.send(Frame::end()).await;
        harness.collect_downstream().await;

        assert!(context.is_empty());
    }

    #[tokio::test]
    async fn test_assistant_interruption_discards_partial() {
        let context = ContextHandle::new();
        let mut harness = ProcessorHarness::start(AssistantAggregator::new(context.clone()));

        harness.send(FrameKind::ResponseStarted.into()).await;
        harness.send(Frame::text_delta("I was say")).await;
        // Let the partial reply through before interrupting it.
        for _ in 0..2 {
            harness.downstream.recv().await.unwrap();
        }
        harness.send(FrameKind::Interruption.into()).await;
        harness.send(FrameKind::ResponseCompleted.into()).await;
        harness.send(FrameKind::ResponseStarted.into()).await;
        harness.send(Frame::text_delta("Sure.")).await;
        harness.send(FrameKind::ResponseCompleted.into()).await;
        harness.send(Frame::end()).await;
        harness.collect_downstream().await;

        assert_eq!(texts(&context), vec![(Role::Assistant, "Sure.".to_string())]);
    }

    #[tokio::test]
    async fn test_assistant_cancel_mid_response_commits_nothing() {
        let context = ContextHandle::new();
        let mut harness = ProcessorHarness::start(AssistantAggregator::new(context.clone()));

        harness.send(FrameKind::ResponseStarted.into()).await;
        harness.send(Frame::text_delta("partial")).await;
        harness.send(Frame::cancel(CancelReason::ClientDisconnected)).await;
        let kinds = harness.collect_downstream().await;
        assert_eq!(
            kinds.last(),
            Some(&FrameKind::Cancel(CancelReason::ClientDisconnected))
        );
        harness.join().await;

        assert!(context.is_empty());
    }

    #[tokio::test]
    async fn test_speech_interrupts_only_a_response_in_flight() {
        let pair = ContextAggregatorPair::new(ContextHandle::new());
        let mut user = ProcessorHarness::start(pair.user());
        let mut assistant = ProcessorHarness::start(pair.assistant());

        // Idle: speaking is just the start of a turn
        user.send(FrameKind::SpeechStarted.into()).await;
        assert_eq!(
            user.downstream.recv().await.unwrap().0.into_kind(),
            FrameKind::SpeechStarted
        );
        assert!(!pair.is_responding());

        assistant.send(FrameKind::ResponseStarted.into()).await;
        assistant.downstream.recv().await.unwrap();
        assert!(pair.is_responding());

        // Barge-in while the reply streams
        user.send(FrameKind::SpeechStarted.into()).await;
        user.send(Frame::end()).await;
        let kinds = user.collect_downstream().await;
        assert_eq!(
            kinds.iter().filter(|k| **k == FrameKind::Interruption).count(),
            1
        );
        assert!(!pair.is_responding());

        assistant.send(Frame::end()).await;
        assistant.collect_downstream().await;
    }

    #[tokio::test]
    async fn test_response_flag_follows_the_turn() {
        let pair = ContextAggregatorPair::new(ContextHandle::new());
        let mut user = ProcessorHarness::start(pair.user());
        let mut assistant = ProcessorHarness::start(pair.assistant());

        user.send(Frame::transcription("Hello", true)).await;
        user.send(FrameKind::EndOfTurn.into()).await;
        user.send(Frame::end()).await;
        user.collect_downstream().await;
        // Set as soon as the run is triggered
        assert!(pair.is_responding());

        assistant.send(FrameKind::ResponseStarted.into()).await;
        assistant.send(Frame::text_delta("Hi")).await;
        assistant.send(FrameKind::ResponseCompleted.into()).await;
        assistant.send(Frame::end()).await;
        assistant.collect_downstream().await;
        assert!(!pair.is_responding());

        // A fresh user half sees the cleared flag: no interruption
        let mut next = ProcessorHarness::start(pair.user());
        next.send(FrameKind::SpeechStarted.into()).await;
        next.send(Frame::end()).await;
        let kinds = next.collect_downstream().await;
        assert_eq!(kinds, vec![FrameKind::SpeechStarted, FrameKind::End]);
    }

    #[tokio::test]
    async fn test_pair_shares_context() {
        let pair = ContextAggregatorPair::new(ContextHandle::new()).with_interruptions(false);
        let user = pair.user();
        let assistant = pair.assistant();
        assert!(!user.allow_interruptions);
        assert!(!assistant.in_response());

        let mut user_harness = ProcessorHarness::start(user);
        let mut assistant_harness = ProcessorHarness::start(assistant);

        user_harness.send(Frame::transcription("Hello", true)).await;
        user_harness.send(FrameKind::EndOfTurn.into()).await;
        user_harness.send(Frame::end()).await;
        user_harness.collect_downstream().await;

        assistant_harness.send(FrameKind::ResponseStarted.into()).await;
        assistant_harness.send(Frame::text_delta("Hi there")).await;
        assistant_harness.send(FrameKind::ResponseCompleted.into()).await;
        assistant_harness.send(Frame::end()).await;
        assistant_harness.collect_downstream().await;

        assert_eq!(
            texts(pair.context()),
            vec![
                (Role::User, "Hello".to_string()),
                (Role::Assistant, "Hi there".to_string()),
            ]
        );
    }
}
