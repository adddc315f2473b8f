use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::Config;
use crate::context::TurnContext;
use crate::error::{HarnessError, Result};
use crate::hands::Browser;
use crate::replay::{ReplayEvent, ReplayLog, Speaker};
use crate::snapshot::{SnapshotWriter, page_file_name};
use crate::types::{ChatMessage, ElementRecord};

/// Utterance logged for the instructor when the session is closed.
pub const FAREWELL: &str = "That's all";

/// One running demonstration: the browser it drives and everything the turn
/// loop keeps between turns.
pub struct Session<B: Browser> {
    browser: Option<B>,
    state: SessionState,
}

/// Counters, logs and buffers of a session, apart from the browser handle.
pub struct SessionState {
    pub(crate) config: Config,
    pub(crate) replay: ReplayLog,
    pub(crate) snapshots: SnapshotWriter,
    /// Replay index of the most recently reserved slot, -1 before the first.
    pub(crate) turn_index: i64,
    /// Index the next page snapshot is saved under.
    pub(crate) page_index: u64,
    /// Interactive elements from the latest scan.
    pub(crate) elements: Vec<ElementRecord>,
    pub(crate) messages: Vec<ChatMessage>,
    pub(crate) latest_screenshot: Option<PathBuf>,
}

impl<B: Browser> Session<B> {
    /// Prepares the data directory and starts an empty replay. Snapshots and
    /// screenshots from an earlier run are removed.
    pub fn init(config: Config, browser: B) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let snapshots = SnapshotWriter::new(config.pages_dir(), config.bboxes_dir());
        snapshots.reset()?;

        let screenshot = config.screenshot_path();
        if screenshot.exists() {
            std::fs::remove_file(&screenshot)?;
        }

        let replay = ReplayLog::create(config.replay_path(), Utc::now())?;
        info!(data_dir = %config.data_dir.display(), "session initialised");

        Ok(Self {
            browser: Some(browser),
            state: SessionState {
                config,
                replay,
                snapshots,
                turn_index: -1,
                page_index: 0,
                elements: Vec::new(),
                messages: Vec::new(),
                latest_screenshot: None,
            },
        })
    }

    /// Logs the farewell, closes the browser and clears the chat. Calling it
    /// again is a no-op. If the farewell cannot be written the session stays
    /// open and the log is left as it was.
    pub fn teardown(&mut self) -> Result<()> {
        if self.browser.is_none() {
            return Ok(());
        }

        let state = &mut self.state;
        let farewell = state.reserve_turn().and_then(|_| {
            let timestamp = state.replay.now();
            state
                .replay
                .finalize(ReplayEvent::chat(timestamp, Speaker::Instructor, FAREWELL))
        });
        if let Err(e) = farewell {
            if let Err(undo) = state.abandon_turn() {
                warn!(error = %undo, "could not drop the farewell slot");
            }
            return Err(e);
        }

        if let Some(browser) = self.browser.take() {
            if let Err(e) = browser.close() {
                warn!(error = %e, "browser did not close cleanly");
            }
        }
        let state = &mut self.state;
        state.messages.clear();
        state.elements.clear();
        info!(events = state.replay.len(), "session closed");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.browser.is_some()
    }

    pub fn browser(&self) -> Result<&B> {
        self.browser.as_ref().ok_or(HarnessError::SessionClosed)
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut SessionState {
        &mut self.state
    }

    /// The browser and the state, borrowed together.
    pub(crate) fn parts_mut(&mut self) -> Result<(&B, &mut SessionState)> {
        let browser = self.browser.as_ref().ok_or(HarnessError::SessionClosed)?;
        Ok((browser, &mut self.state))
    }
}

impl SessionState {
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn turn_index(&self) -> i64 {
        self.turn_index
    }

    pub fn page_index(&self) -> u64 {
        self.page_index
    }

    pub fn replay(&self) -> &ReplayLog {
        &self.replay
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn elements(&self) -> &[ElementRecord] {
        &self.elements
    }

    pub fn latest_screenshot(&self) -> Option<&Path> {
        self.latest_screenshot.as_deref()
    }

    pub fn snapshots(&self) -> &SnapshotWriter {
        &self.snapshots
    }

    /// Page file of the last saved snapshot; `None` until a page was saved.
    pub fn prior_state(&self) -> Option<String> {
        self.page_index.checked_sub(1).map(page_file_name)
    }

    pub fn viewport(&self) -> (u32, u32) {
        (self.config.viewport_width, self.config.viewport_height)
    }

    /// Opens the next replay slot and moves `turn_index` onto it.
    pub(crate) fn reserve_turn(&mut self) -> Result<usize> {
        let slot = self.replay.begin_turn(self.prior_state(), self.viewport())?;
        self.turn_index = slot as i64;
        Ok(slot)
    }

    /// Drops an unfinished slot and moves `turn_index` back with it. The
    /// slot leaves memory even when rewriting the file fails.
    pub(crate) fn abandon_turn(&mut self) -> Result<()> {
        let discarded = self.replay.discard_pending();
        self.turn_index = self.replay.len() as i64 - 1;
        discarded.map(|_| ())
    }

    /// Records an instructor message in its own slot.
    pub(crate) fn record_instruction(&mut self, text: &str) -> Result<()> {
        self.reserve_turn()?;
        let timestamp = self.replay.now();
        self.replay
            .finalize(ReplayEvent::chat(timestamp, Speaker::Instructor, text))?;
        self.messages.push(ChatMessage::user(text));
        Ok(())
    }

    pub fn turn_context<'a>(
        &'a self,
        prior_state: Option<&'a str>,
        current_url: Option<&'a str>,
    ) -> TurnContext<'a> {
        TurnContext {
            demo_name: &self.config.demo_name,
            turn_index: self.turn_index.max(0) as usize,
            events: self.replay.events(),
            elements: &self.elements,
            prior_state,
            current_url,
            viewport: self.viewport(),
            num_candidates: self.config.num_candidates,
            max_prompt_chars: self.config.max_prompt_chars,
        }
    }
}
