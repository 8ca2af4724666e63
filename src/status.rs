use crate::probe::Controls;
use log::{error, info};
use std::sync::mpsc::Sender;

pub const FAILURE_PREFIX: &str = "Error: ";

/// A fire-and-forget progress notification. The presentation layer shows
/// whatever arrived last.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusEvent {
    pub headline: String,
    pub detail: String,
    pub progress: u8,
}

impl StatusEvent {
    pub fn new(headline: impl Into<String>, detail: impl Into<String>, progress: u8) -> Self {
        Self {
            headline: headline.into(),
            detail: detail.into(),
            progress: progress.min(100),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.headline.starts_with(FAILURE_PREFIX)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum UiEvent {
    Status(StatusEvent),
    Controls(Controls),
}

/// Publishes status and control events to whoever holds the receiving end.
///
/// A dropped receiver is not an error: events are simply discarded, which is
/// what headless callers want.
#[derive(Clone, Debug, Default)]
pub struct StatusReporter {
    sender: Option<Sender<UiEvent>>,
}

impl StatusReporter {
    pub fn new(sender: Sender<UiEvent>) -> Self {
        Self {
            sender: Some(sender),
        }
    }

    pub fn silent() -> Self {
        Self { sender: None }
    }

    pub fn progress(&self, headline: impl Into<String>, detail: impl Into<String>, progress: u8) {
        let event = StatusEvent::new(headline, detail, progress);
        info!("[{}%] {} - {}", event.progress, event.headline, event.detail);
        self.send(UiEvent::Status(event));
    }

    /// Reports a failure. The headline gets the failure prefix and progress
    /// drops back to zero.
    pub fn failure(&self, headline: impl AsRef<str>, detail: impl std::fmt::Display) {
        let event = StatusEvent::new(
            format!("{FAILURE_PREFIX}{}", headline.as_ref()),
            detail.to_string(),
            0,
        );
        error!("{} - {}", event.headline, event.detail);
        self.send(UiEvent::Status(event));
    }

    pub fn controls(&self, controls: Controls) {
        self.send(UiEvent::Controls(controls));
    }

    fn send(&self, event: UiEvent) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(event);
        }
    }
}
