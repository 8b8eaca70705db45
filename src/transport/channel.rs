//! In-memory transport backed by tokio channels.
//!
//! The pipeline side is a [`ChannelTransport`]; the remote peer is played by
//! the [`ChannelTransportHandle`], which feeds input, reads output and raises
//! lifecycle events. Used by the CLI and by integration tests.

use crate::error::{Result, VocalinkError};
use crate::frames::AudioChunk;
use crate::pipeline::processor::Processor;
use crate::transport::{
    InputItem, InputTransport, OutputItem, OutputTransport, Transport, TransportEvent,
    TransportParams,
};
use tokio::sync::mpsc;

const EVENT_CAPACITY: usize = 16;

pub struct ChannelTransport {
    params: TransportParams,
    input: Option<mpsc::Receiver<InputItem>>,
    output: Option<mpsc::Sender<OutputItem>>,
    events: Option<mpsc::Receiver<TransportEvent>>,
}

impl ChannelTransport {
    /// Creates a transport and the peer handle driving it. `capacity` bounds
    /// both the input and the output channel.
    pub fn new(params: TransportParams, capacity: usize) -> (Self, ChannelTransportHandle) {
        let (input_tx, input_rx) = mpsc::channel(capacity.max(1));
        let (output_tx, output_rx) = mpsc::channel(capacity.max(1));
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);

        let transport = Self {
            params,
            input: Some(input_rx),
            output: Some(output_tx),
            events: Some(events_rx),
        };
        let handle = ChannelTransportHandle {
            client_id: "local".to_string(),
            input: Some(input_tx),
            output: Some(output_rx),
            events: events_tx,
        };
        (transport, handle)
    }

    pub fn params(&self) -> TransportParams {
        self.params
    }
}

impl Transport for ChannelTransport {
    fn input(&mut self) -> Result<Box<dyn Processor>> {
        let source = self.input.take().ok_or_else(|| VocalinkError::TransportFailure {
            message: "transport input already taken".to_string(),
        })?;
        Ok(Box::new(InputTransport::new(source, self.params)))
    }

    fn output(&mut self) -> Result<Box<dyn Processor>> {
        let sink = self.output.take().ok_or_else(|| VocalinkError::TransportFailure {
            message: "transport output already taken".to_string(),
        })?;
        Ok(Box::new(OutputTransport::new(sink, self.params)))
    }

    fn events(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events.take()
    }
}

/// The remote peer's side of a [`ChannelTransport`].
#[derive(Debug)]
pub struct ChannelTransportHandle {
    client_id: String,
    input: Option<mpsc::Sender<InputItem>>,
    output: Option<mpsc::Receiver<OutputItem>>,
    events: mpsc::Sender<TransportEvent>,
}

impl ChannelTransportHandle {
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub async fn connect(&self) -> Result<()> {
        self.event(TransportEvent::ClientConnected {
            client_id: self.client_id.clone(),
        })
        .await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.event(TransportEvent::ClientDisconnected {
            client_id: self.client_id.clone(),
        })
        .await
    }

    /// Simulate a dropped connection.
    pub async fn fail(&self, message: impl Into<String>) -> Result<()> {
        self.event(TransportEvent::Failed {
            message: message.into(),
        })
        .await
    }

    async fn event(&self, event: TransportEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| VocalinkError::TransportFailure {
                message: "task no longer listening for transport events".to_string(),
            })
    }

    pub async fn send_audio(&self, chunk: AudioChunk) -> Result<()> {
        self.send(InputItem::Audio(chunk)).await
    }

    /// Send final user text, as a peer-side recognizer would.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(InputItem::Text(text.into())).await
    }

    pub async fn end_of_turn(&self) -> Result<()> {
        self.send(InputItem::EndOfTurn).await
    }

    async fn send(&self, item: InputItem) -> Result<()> {
        let input = self.input.as_ref().ok_or_else(|| VocalinkError::TransportFailure {
            message: "input already closed".to_string(),
        })?;
        input
            .send(item)
            .await
            .map_err(|_| VocalinkError::TransportFailure {
                message: "pipeline input closed".to_string(),
            })
    }

    /// Close the input side; the pipeline receives `End` after the last item.
    pub fn close_input(&mut self) {
        self.input = None;
    }

    /// `None` once the pipeline's output side is gone or the receiver was taken.
    pub async fn recv_output(&mut self) -> Option<OutputItem> {
        match self.output.as_mut() {
            Some(output) => output.recv().await,
            None => None,
        }
    }

    pub fn try_recv_output(&mut self) -> Option<OutputItem> {
        self.output.as_mut().and_then(|output| output.try_recv().ok())
    }

    /// Moves output reading elsewhere, e.g. into its own task.
    pub fn take_output(&mut self) -> Option<mpsc::Receiver<OutputItem>> {
        self.output.take()
    }
}
