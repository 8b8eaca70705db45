//! Transport capability: where audio comes from and where replies go.
//!
//! A transport contributes two processors, one at each end of the pipeline,
//! and a stream of connection lifecycle events the task subscribes to.

pub mod channel;

pub use channel::{ChannelTransport, ChannelTransportHandle};

use crate::error;
use crate::frames::{AudioChunk, CancelReason, Frame, FrameDirection, FrameKind};
use crate::pipeline::error::ProcessorError;
use crate::pipeline::processor::{FrameEmitter, Outbox, Processor};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Connection lifecycle reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportEvent {
    ClientConnected { client_id: String },
    ClientDisconnected { client_id: String },
    /// The connection dropped; handled like a disconnect.
    Failed { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportParams {
    pub audio_in_enabled: bool,
    pub audio_out_enabled: bool,
}

impl Default for TransportParams {
    fn default() -> Self {
        Self {
            audio_in_enabled: true,
            audio_out_enabled: true,
        }
    }
}

/// Something the remote peer sends in.
#[derive(Debug, Clone, PartialEq)]
pub enum InputItem {
    Audio(AudioChunk),
    /// Final text for the current user turn, from a peer-side recognizer or a keyboard.
    Text(String),
    EndOfTurn,
}

/// Something delivered back to the remote peer.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputItem {
    Audio(AudioChunk),
    Text(String),
    TurnComplete,
    /// Playback of the current response should stop.
    Interrupted,
}

/// A transport provides the pipeline's two ends and its lifecycle events.
pub trait Transport: Send {
    /// Processor that feeds peer input into the pipeline. Taken once.
    fn input(&mut self) -> error::Result<Box<dyn Processor>>;

    /// Processor that delivers pipeline output to the peer. Taken once.
    fn output(&mut self) -> error::Result<Box<dyn Processor>>;

    /// Lifecycle event subscription. `None` once taken.
    fn events(&mut self) -> Option<mpsc::Receiver<TransportEvent>>;
}

/// Pumps a peer input channel into the pipeline.
///
/// Items enter through the processor's own inbox, so frames queued by the
/// task and frames from the peer share one ordered path. When the peer
/// closes its side, `End` follows the last item.
pub struct InputTransport {
    source: Option<mpsc::Receiver<InputItem>>,
    params: TransportParams,
    pump: Option<JoinHandle<()>>,
}

impl InputTransport {
    pub fn new(source: mpsc::Receiver<InputItem>, params: TransportParams) -> Self {
        Self {
            source: Some(source),
            params,
            pump: None,
        }
    }
}

#[async_trait]
impl Processor for InputTransport {
    fn name(&self) -> &str {
        "transport_input"
    }

    async fn start(&mut self, emitter: &FrameEmitter) -> Result<(), ProcessorError> {
        let Some(source) = self.source.take() else {
            return Err(ProcessorError::Fatal("input source already consumed".to_string()));
        };
        self.pump = Some(tokio::spawn(pump_input(
            source,
            emitter.clone(),
            self.params.audio_in_enabled,
        )));
        Ok(())
    }

    async fn process(
        &mut self,
        frame: Frame,
        direction: FrameDirection,
        out: &mut Outbox,
    ) -> Result<(), ProcessorError> {
        out.forward(frame, direction);
        Ok(())
    }

    async fn on_cancel(&mut self, _reason: &CancelReason) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }

    async fn shutdown(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

async fn pump_input(
    mut source: mpsc::Receiver<InputItem>,
    emitter: FrameEmitter,
    audio_in_enabled: bool,
) {
    let cancelled = emitter.cancellation();
    let mut chunks = 0u64;
    loop {
        let item = tokio::select! {
            biased;
            () = cancelled.cancelled() => return,
            item = source.recv() => item,
        };
        let frame = match item {
            Some(InputItem::Audio(chunk)) if audio_in_enabled => {
                chunks += 1;
                Frame::input_audio(chunk)
            }
            Some(InputItem::Audio(_)) => continue,
            Some(InputItem::Text(text)) => Frame::transcription(text, true),
            Some(InputItem::EndOfTurn) => Frame::new(FrameKind::EndOfTurn),
            None => {
                debug!(chunks, "peer input closed");
                if emitter.push_inbound(Frame::end()).await.is_err() {
                    debug!("end of input not delivered, pipeline stopping");
                }
                return;
            }
        };
        if emitter.push_inbound(frame).await.is_err() {
            return;
        }
    }
}

/// Delivers response audio and text to the peer.
pub struct OutputTransport {
    sink: mpsc::Sender<OutputItem>,
    params: TransportParams,
    peer_gone: bool,
}

impl OutputTransport {
    pub fn new(sink: mpsc::Sender<OutputItem>, params: TransportParams) -> Self {
        Self {
            sink,
            params,
            peer_gone: false,
        }
    }

    async fn deliver(&mut self, item: OutputItem) {
        if self.peer_gone {
            return;
        }
        if self.sink.send(item).await.is_err() {
            // Disconnect is reported through transport events.
            warn!("peer output closed, dropping further output");
            self.peer_gone = true;
        }
    }
}

#[async_trait]
impl Processor for OutputTransport {
    fn name(&self) -> &str {
        "transport_output"
    }

    async fn process(
        &mut self,
        frame: Frame,
        direction: FrameDirection,
        out: &mut Outbox,
    ) -> Result<(), ProcessorError> {
        if direction == FrameDirection::Downstream {
            let item = match frame.kind() {
                FrameKind::OutputAudio(chunk) if self.params.audio_out_enabled => {
                    Some(OutputItem::Audio(chunk.clone()))
                }
                FrameKind::TextDelta(text) => Some(OutputItem::Text(text.clone())),
                FrameKind::ResponseCompleted => Some(OutputItem::TurnComplete),
                FrameKind::Interruption => Some(OutputItem::Interrupted),
                _ => None,
            };
            if let Some(item) = item {
                self.deliver(item).await;
            }
        }
        out.forward(frame, direction);
        Ok(())
    }

    async fn on_end(&mut self, _out: &mut Outbox) -> Result<(), ProcessorError> {
        info!("output complete");
        Ok(())
    }
}
