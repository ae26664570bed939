// JSON lines bridge
// Lets a browser extension host drive the tracker over stdin/stdout

use crate::identity::Correction;
use crate::machine::LifecycleEvent;
use crate::registry::{LifecycleListener, TabId};
use crate::sample::PlaybackSample;
use crate::tracker::TrackerHandle;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One inbound line
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    Attach {
        tab: TabId,
    },
    Detach {
        tab: TabId,
    },
    Activate {
        tab: TabId,
    },
    Sample {
        tab: TabId,
        #[serde(flatten)]
        sample: PlaybackSample,
    },
    Correct {
        tab: TabId,
        #[serde(flatten)]
        correction: Correction,
    },
    Love {
        tab: TabId,
        loved: bool,
    },
    Skip {
        tab: TabId,
    },
    Current {
        tab: TabId,
    },
}

impl InboundMessage {
    pub fn parse(line: &str) -> Result<Self> {
        serde_json::from_str(line).with_context(|| format!("Invalid message: {}", line))
    }
}

/// Apply a message; returns a JSON reply for queries
pub async fn apply(handle: &TrackerHandle, message: InboundMessage) -> Result<Option<serde_json::Value>> {
    match message {
        InboundMessage::Attach { tab } => {
            handle.attach(tab).await?;
        }
        InboundMessage::Detach { tab } => handle.detach(tab)?,
        InboundMessage::Activate { tab } => handle.activate(tab)?,
        InboundMessage::Sample { tab, sample } => handle.sample(tab, sample.normalized())?,
        InboundMessage::Correct { tab, correction } => handle.correct_identity(tab, correction)?,
        InboundMessage::Love { tab, loved } => handle.toggle_love(tab, loved)?,
        InboundMessage::Skip { tab } => handle.skip(tab)?,
        InboundMessage::Current { tab } => {
            let item = handle.current_item(tab).await?;
            return Ok(Some(serde_json::json!({ "tab": tab, "current": item })));
        }
    }
    Ok(None)
}

#[derive(Serialize)]
struct Envelope<'a> {
    tab: TabId,
    #[serde(flatten)]
    event: &'a LifecycleEvent,
}

/// Cloneable sender of JSON lines to one output
///
/// A dedicated task owns the output, so a slow reader never stalls the tracker.
/// Lines from every clone come out whole and in send order.
#[derive(Clone)]
pub struct JsonLinesWriter {
    lines: mpsc::UnboundedSender<Vec<u8>>,
}

impl JsonLinesWriter {
    /// Start the writer task; it hands `out` back once every clone is dropped
    pub fn spawn<W>(mut out: W) -> (Self, JoinHandle<W>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (lines, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let task = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                let written = match out.write_all(&line).await {
                    Ok(()) => out.flush().await,
                    Err(e) => Err(e),
                };
                if let Err(e) = written {
                    log::warn!("Failed to write output line, stopping writer: {}", e);
                    break;
                }
            }
            out
        });
        (Self { lines }, task)
    }

    pub fn send<T: Serialize + ?Sized>(&self, value: &T) {
        let mut line = match serde_json::to_vec(value) {
            Ok(line) => line,
            Err(e) => {
                log::warn!("Failed to serialize output line: {}", e);
                return;
            }
        };
        line.push(b'\n');
        if self.lines.send(line).is_err() {
            log::debug!("Writer task has stopped, dropping output line");
        }
    }
}

/// Writes every lifecycle event as one JSON line
pub struct JsonLinesListener {
    writer: JsonLinesWriter,
}

impl JsonLinesListener {
    pub fn new(writer: JsonLinesWriter) -> Self {
        Self { writer }
    }
}

impl LifecycleListener for JsonLinesListener {
    fn on_event(&mut self, tab_id: TabId, event: &LifecycleEvent) {
        self.writer.send(&Envelope { tab: tab_id, event });
    }
}
