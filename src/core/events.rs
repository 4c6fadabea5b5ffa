//! Status events emitted by a running pipeline.
//!
//! The channel is unbounded: events are low-rate and sends must never block a
//! stage that holds the device in an intermediate state.

use tokio::sync::mpsc;
use tracing::debug;

use super::models::{DeviceState, PipelineState, PrepareStep};

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    State(PipelineState),
    Status(String),
    Percent(u8),
    Step(PrepareStep),
    /// Whether the control that started the run may be used again.
    Controls { enabled: bool },
    /// Non-fatal estimation problem.
    Degraded(String),
    Failed {
        message: String,
        device_state: DeviceState,
    },
    Completed,
}

pub type EventReceiver = mpsc::UnboundedReceiver<PipelineEvent>;

/// Fire-and-forget sender handed to every stage.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<PipelineEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: PipelineEvent) {
        if self.tx.send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }

    pub fn status(&self, text: impl Into<String>) {
        self.emit(PipelineEvent::Status(text.into()));
    }

    pub fn percent(&self, value: u8) {
        self.emit(PipelineEvent::Percent(value.min(100)));
    }

    pub fn state(&self, state: PipelineState) {
        self.emit(PipelineEvent::State(state));
    }

    pub fn step(&self, step: PrepareStep) {
        self.emit(PipelineEvent::Step(step));
    }
}
