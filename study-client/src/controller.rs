//! Terminal I/O controller
//!
//! Owns at most one relay channel. Output goes to the terminal widget and
//! into the accumulator; the boundary detector decides when the
//! accumulator becomes a transcript. Keystrokes go out unmodified.
//!
//! Every attach gets a new generation number. Events tagged with an older
//! generation belong to a channel that was already replaced and are
//! dropped.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::accumulator::OutputAccumulator;
use crate::channel::{ChannelError, ChannelEvent, ClientChannel, RelayConnector};
use crate::detector::{Boundary, BoundaryDetector};

/// Wherever terminal output is rendered.
pub trait TerminalWidget: Send {
    fn write(&mut self, data: &[u8]);
}

struct ActiveChannel {
    generation: u64,
    port: u16,
    outbound: mpsc::UnboundedSender<Bytes>,
    pump: JoinHandle<()>,
}

pub struct TerminalController {
    connector: Arc<dyn RelayConnector>,
    detector: Box<dyn BoundaryDetector>,
    widget: Box<dyn TerminalWidget>,
    accumulator: OutputAccumulator,
    active: Option<ActiveChannel>,
    next_generation: u64,
}

impl TerminalController {
    pub fn new(
        connector: Arc<dyn RelayConnector>,
        detector: Box<dyn BoundaryDetector>,
        widget: Box<dyn TerminalWidget>,
    ) -> Self {
        Self {
            connector,
            detector,
            widget,
            accumulator: OutputAccumulator::new(),
            active: None,
            next_generation: 0,
        }
    }

    /// Open a channel to `port`, replacing any current one.
    ///
    /// `on_event` receives every channel event tagged with the generation
    /// returned here. The last event is always [`ChannelEvent::Closed`]
    /// unless the channel is detached first.
    pub async fn attach<F>(&mut self, port: u16, on_event: F) -> Result<u64, ChannelError>
    where
        F: Fn(u64, ChannelEvent) + Send + 'static,
    {
        self.detach();
        self.accumulator.clear();
        self.next_generation += 1;
        let generation = self.next_generation;

        let ClientChannel {
            outbound,
            mut inbound,
        } = self.connector.open(port).await?;

        let pump = tokio::spawn(async move {
            while let Some(event) = inbound.recv().await {
                let closed = matches!(event, ChannelEvent::Closed { .. });
                on_event(generation, event);
                if closed {
                    return;
                }
            }
            on_event(
                generation,
                ChannelEvent::Closed {
                    reason: "channel dropped".to_string(),
                },
            );
        });

        info!(port, generation, "terminal attached");
        self.active = Some(ActiveChannel {
            generation,
            port,
            outbound,
            pump,
        });
        Ok(generation)
    }

    /// Close the current channel, if any. Nothing it delivers afterwards is
    /// processed.
    pub fn detach(&mut self) {
        if let Some(active) = self.active.take() {
            active.pump.abort();
            debug!(port = active.port, generation = active.generation, "terminal detached");
        }
    }

    /// Feed output from channel `generation`. Returns the transcript when
    /// this output completes a command.
    pub fn on_output(&mut self, generation: u64, data: &[u8]) -> Option<String> {
        if !self.is_current(generation) {
            return None;
        }
        self.widget.write(data);
        self.accumulator.append(data);

        match self.detector.is_boundary(self.accumulator.as_bytes()) {
            Some(Boundary::CommandFinished) => Some(self.accumulator.take_text()),
            Some(Boundary::IdlePrompt) => {
                self.accumulator.clear();
                None
            }
            None => None,
        }
    }

    /// Returns `true` if `generation` was the live channel.
    pub fn on_closed(&mut self, generation: u64) -> bool {
        if !self.is_current(generation) {
            return false;
        }
        self.active = None;
        true
    }

    pub fn send_keys(&self, data: Bytes) -> Result<(), ChannelError> {
        let active = self.active.as_ref().ok_or(ChannelError::Closed)?;
        active.outbound.send(data).map_err(|_| ChannelError::Closed)
    }

    pub fn is_attached(&self) -> bool {
        self.active.is_some()
    }

    pub fn port(&self) -> Option<u16> {
        self.active.as_ref().map(|a| a.port)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| a.generation == generation)
    }
}

impl Drop for TerminalController {
    fn drop(&mut self) {
        self.detach();
    }
}
