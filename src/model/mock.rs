//! In-process model backends for tests and demos.

use crate::defaults::{RESPONSE_STREAM_CAPACITY, SAMPLE_RATE};
use crate::error::{Result, VocalinkError};
use crate::frames::AudioChunk;
use crate::model::{ModelBackend, ResponseEvent, ResponseStream, RunRequest};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
enum Script {
    Reply(String),
    /// `run` itself fails.
    Failure(String),
    /// Stream some text, then report an error.
    StreamFailure { partial: String, message: String },
}

/// Backend that replays queued replies in order, recording every request.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<RunRequest>>,
    audio_chunks: AtomicUsize,
    delta_delay: Duration,
    hang: bool,
    usage: Option<(u64, u64)>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply, streamed one word per delta.
    pub fn with_reply(self, text: impl Into<String>) -> Self {
        self.with_script(Script::Reply(text.into()))
    }

    pub fn with_replies<I, S>(self, replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        replies
            .into_iter()
            .fold(self, |backend, reply| backend.with_reply(reply))
    }

    /// Queue a run that fails before streaming anything.
    pub fn with_failure(self, message: impl Into<String>) -> Self {
        self.with_script(Script::Failure(message.into()))
    }

    /// Queue a run that streams `partial` and then errors.
    pub fn with_stream_failure(
        self,
        partial: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        self.with_script(Script::StreamFailure {
            partial: partial.into(),
            message: message.into(),
        })
    }

    /// Pause between deltas.
    pub fn with_delta_delay(mut self, delay: Duration) -> Self {
        self.delta_delay = delay;
        self
    }

    /// Stream replies but never complete them.
    pub fn with_hang(mut self) -> Self {
        self.hang = true;
        self
    }

    /// Report token usage before completing.
    pub fn with_usage(mut self, prompt_tokens: u64, completion_tokens: u64) -> Self {
        self.usage = Some((prompt_tokens, completion_tokens));
        self
    }

    fn with_script(self, script: Script) -> Self {
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(script);
        self
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<RunRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn run_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Realtime audio chunks received.
    pub fn audio_chunks(&self) -> usize {
        self.audio_chunks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn run(&self, request: RunRequest) -> Result<ResponseStream> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
        let script = self
            .scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();

        let (events, tail) = match script {
            Some(Script::Reply(text)) => {
                let mut tail = Vec::new();
                if let Some((prompt_tokens, completion_tokens)) = self.usage {
                    tail.push(ResponseEvent::Usage {
                        prompt_tokens,
                        completion_tokens,
                    });
                }
                if !self.hang {
                    tail.push(ResponseEvent::Completed);
                }
                (word_deltas(&text), tail)
            }
            Some(Script::StreamFailure { partial, message }) => {
                (word_deltas(&partial), vec![ResponseEvent::Error(message)])
            }
            Some(Script::Failure(message)) => {
                return Err(VocalinkError::BackendFailure {
                    backend: self.name().to_string(),
                    message,
                });
            }
            None => {
                return Err(VocalinkError::BackendFailure {
                    backend: self.name().to_string(),
                    message: "no scripted reply left".to_string(),
                });
            }
        };

        let (tx, rx) = mpsc::channel(RESPONSE_STREAM_CAPACITY);
        let delay = self.delta_delay;
        let hang = self.hang;
        tokio::spawn(async move {
            if tx.send(ResponseEvent::Started).await.is_err() {
                return;
            }
            for text in events {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(ResponseEvent::TextDelta(text)).await.is_err() {
                    return;
                }
            }
            for event in tail {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            if hang {
                tx.closed().await;
            }
        });
        Ok(rx)
    }

    async fn send_audio(&self, _chunk: &AudioChunk) -> Result<()> {
        self.audio_chunks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Demo backend that repeats the last user message back.
#[derive(Debug, Clone)]
pub struct EchoBackend {
    prefix: String,
    speak: bool,
    word_delay: Duration,
}

impl Default for EchoBackend {
    fn default() -> Self {
        Self {
            prefix: "You said:".to_string(),
            speak: false,
            word_delay: Duration::ZERO,
        }
    }
}

impl EchoBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Also stream a short tone per word as output audio.
    pub fn with_audio(mut self, enabled: bool) -> Self {
        self.speak = enabled;
        self
    }

    pub fn with_word_delay(mut self, delay: Duration) -> Self {
        self.word_delay = delay;
        self
    }

    fn reply_for(&self, request: &RunRequest) -> String {
        match request.last_user_text() {
            Some(text) if !text.trim().is_empty() => {
                format!("{} {}", self.prefix, text.trim())
            }
            _ => "I didn't catch that.".to_string(),
        }
    }
}

#[async_trait]
impl ModelBackend for EchoBackend {
    fn name(&self) -> &str {
        "echo"
    }

    async fn run(&self, request: RunRequest) -> Result<ResponseStream> {
        let reply = self.reply_for(&request);
        let prompt_tokens: usize = request
            .full_messages()
            .iter()
            .map(|m| m.text().split_whitespace().count())
            .sum();
        let deltas = word_deltas(&reply);
        let completion_tokens = deltas.len() as u64;
        let speak = self.speak;
        let delay = self.word_delay;

        let (tx, rx) = mpsc::channel(RESPONSE_STREAM_CAPACITY);
        tokio::spawn(async move {
            if tx.send(ResponseEvent::Started).await.is_err() {
                return;
            }
            for (index, word) in deltas.into_iter().enumerate() {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(ResponseEvent::TextDelta(word)).await.is_err() {
                    return;
                }
                if speak && tx.send(ResponseEvent::Audio(tone(index))).await.is_err() {
                    return;
                }
            }
            let usage = ResponseEvent::Usage {
                prompt_tokens: prompt_tokens as u64,
                completion_tokens,
            };
            if tx.send(usage).await.is_err() {
                return;
            }
            if tx.send(ResponseEvent::Completed).await.is_err() {
                tracing::debug!("echo response abandoned before completion");
            }
        });
        Ok(rx)
    }
}

/// Split text into word deltas that concatenate back to the original.
fn word_deltas(text: &str) -> Vec<String> {
    text.split_inclusive(' ').map(str::to_string).collect()
}

// 100ms sine per word, pitch stepping with the word index
fn tone(index: usize) -> AudioChunk {
    let frequency = 220.0 + 55.0 * (index % 8) as f32;
    let samples = (0..SAMPLE_RATE as usize / 10)
        .map(|n| {
            let t = n as f32 / SAMPLE_RATE as f32;
            ((2.0 * std::f32::consts::PI * frequency * t).sin() * 4000.0) as i16
        })
        .collect();
    AudioChunk::new(samples, SAMPLE_RATE)
}
