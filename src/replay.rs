use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::Result;
use crate::types::{BoundingBox, ElementAttributes};

/// URL written into slot reservations. It never reaches the browser.
pub const PLACEHOLDER_URL: &str = "https://www.google.com/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Instructor,
    Navigator,
}

/// Reference to the page an action was performed on.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PageState {
    pub page: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mouse_x: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mouse_y: Option<i64>,
    pub viewport_width: u32,
    pub viewport_height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadProperties {
    pub url: String,
}

/// The element an action targeted, as it was just before the action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetElement {
    pub url: String,
    pub attributes: ElementAttributes,
    pub bbox: BoundingBox,
    pub tag_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "intent", content = "arguments", rename_all = "camelCase")]
pub enum BrowserAction {
    Load {
        metadata: Metadata,
        properties: LoadProperties,
    },
    Click {
        metadata: Metadata,
        element: TargetElement,
    },
    TextInput {
        metadata: Metadata,
        element: TargetElement,
        text: String,
    },
    Scroll {
        metadata: Metadata,
        #[serde(rename = "scrollX")]
        scroll_x: f64,
        #[serde(rename = "scrollY")]
        scroll_y: f64,
    },
    Submit {
        metadata: Metadata,
        element: TargetElement,
    },
    Change {
        metadata: Metadata,
        element: TargetElement,
        value: String,
    },
}

impl BrowserAction {
    pub fn intent(&self) -> &'static str {
        match self {
            BrowserAction::Load { .. } => "load",
            BrowserAction::Click { .. } => "click",
            BrowserAction::TextInput { .. } => "textInput",
            BrowserAction::Scroll { .. } => "scroll",
            BrowserAction::Submit { .. } => "submit",
            BrowserAction::Change { .. } => "change",
        }
    }

    pub fn element(&self) -> Option<&TargetElement> {
        match self {
            BrowserAction::Click { element, .. }
            | BrowserAction::TextInput { element, .. }
            | BrowserAction::Submit { element, .. }
            | BrowserAction::Change { element, .. } => Some(element),
            BrowserAction::Load { .. } | BrowserAction::Scroll { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ReplayEvent {
    Chat {
        timestamp: u64,
        speaker: Speaker,
        utterance: String,
    },
    Browser {
        timestamp: u64,
        state: PageState,
        action: BrowserAction,
        #[serde(default, skip_serializing_if = "is_false")]
        pending: bool,
    },
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl ReplayEvent {
    pub fn chat(timestamp: u64, speaker: Speaker, utterance: impl Into<String>) -> Self {
        ReplayEvent::Chat {
            timestamp,
            speaker,
            utterance: utterance.into(),
        }
    }

    pub fn browser(timestamp: u64, page: Option<String>, action: BrowserAction) -> Self {
        ReplayEvent::Browser {
            timestamp,
            state: PageState { page },
            action,
            pending: false,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, ReplayEvent::Browser { pending: true, .. })
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            ReplayEvent::Chat { timestamp, .. } | ReplayEvent::Browser { timestamp, .. } => *timestamp,
        }
    }
}

#[derive(Serialize)]
struct ReplayFileRef<'a> {
    data: &'a [ReplayEvent],
}

#[derive(Deserialize)]
struct ReplayFile {
    data: Vec<ReplayEvent>,
}

/// Whole seconds between `start` and `now`; zero if the clock went back.
pub fn elapsed_seconds(start: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    (now - start).num_seconds().max(0) as u64
}

/// Ordered chat and browser events of one session, mirrored to disk after
/// every change.
#[derive(Debug)]
pub struct ReplayLog {
    path: PathBuf,
    initial_timestamp: DateTime<Utc>,
    events: Vec<ReplayEvent>,
}

impl ReplayLog {
    /// Starts an empty log, replacing whatever is at `path`.
    pub fn create(path: impl Into<PathBuf>, initial_timestamp: DateTime<Utc>) -> Result<Self> {
        let log = Self {
            path: path.into(),
            initial_timestamp,
            events: Vec::new(),
        };
        log.persist()?;
        Ok(log)
    }

    /// Reopens a log written earlier. Reservations that were never finalized
    /// (a crash mid-turn) are dropped from the end.
    pub fn load(path: impl Into<PathBuf>, initial_timestamp: DateTime<Utc>) -> Result<Self> {
        let path = path.into();
        let file = std::fs::File::open(&path)?;
        let ReplayFile { mut data } = serde_json::from_reader(BufReader::new(file))?;

        let before = data.len();
        while data.last().is_some_and(ReplayEvent::is_pending) {
            data.pop();
        }
        if data.len() != before {
            warn!(dropped = before - data.len(), "discarded unfinished replay events");
        }

        let log = Self {
            path,
            initial_timestamp,
            events: data,
        };
        log.persist()?;
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn initial_timestamp(&self) -> DateTime<Utc> {
        self.initial_timestamp
    }

    pub fn now(&self) -> u64 {
        elapsed_seconds(self.initial_timestamp, Utc::now())
    }

    pub fn events(&self) -> &[ReplayEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn has_pending(&self) -> bool {
        self.events.last().is_some_and(ReplayEvent::is_pending)
    }

    /// Reserves the next slot with a pending placeholder and returns its
    /// index. The placeholder fixes the turn's timestamp and carries the page
    /// the coming action will start from.
    pub fn begin_turn(&mut self, prior_state: Option<String>, viewport: (u32, u32)) -> Result<usize> {
        let timestamp = self.now();
        self.events.push(ReplayEvent::Browser {
            timestamp,
            state: PageState { page: prior_state },
            action: BrowserAction::Load {
                metadata: Metadata {
                    url: PLACEHOLDER_URL.to_string(),
                    mouse_x: Some(0),
                    mouse_y: Some(0),
                    viewport_width: viewport.0,
                    viewport_height: viewport.1,
                },
                properties: LoadProperties {
                    url: PLACEHOLDER_URL.to_string(),
                },
            },
            pending: true,
        });
        self.persist()?;
        Ok(self.events.len() - 1)
    }

    /// Puts the real event into the reserved slot, or appends it when no slot
    /// is open.
    pub fn finalize(&mut self, event: ReplayEvent) -> Result<()> {
        if self.has_pending() {
            self.events.pop();
        }
        self.events.push(event);
        self.persist()
    }

    /// Drops an open reservation. Returns whether there was one.
    pub fn discard_pending(&mut self) -> Result<bool> {
        if !self.has_pending() {
            return Ok(false);
        }
        self.events.pop();
        self.persist()?;
        Ok(true)
    }

    pub fn persist(&self) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &ReplayFileRef { data: &self.events })?;
        writer.flush()?;
        debug!(events = self.events.len(), "replay persisted");
        Ok(())
    }
}
