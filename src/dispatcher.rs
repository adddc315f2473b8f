use std::path::PathBuf;
use tracing::{info, warn};

use crate::dom;
use crate::error::Result;
use crate::hands::Browser;
use crate::parser::ParsedAction;
use crate::replay::{BrowserAction, LoadProperties, Metadata, ReplayEvent, Speaker, TargetElement};
use crate::session::{Session, SessionState};
use crate::types::ChatMessage;

/// What a dispatched action left behind.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    /// Text appended to the chat as the assistant's message.
    pub message: String,
    /// Index of the snapshot written, for page-changing actions.
    pub snapshot: Option<u64>,
    pub screenshot: Option<PathBuf>,
}

/// Carries out `action` in the browser and records it. The turn's replay slot
/// must already be reserved; it is filled only once the effect succeeded, so
/// an error leaves counters and snapshots untouched.
pub fn dispatch<B: Browser>(session: &mut Session<B>, action: &ParsedAction) -> Result<DispatchOutcome> {
    let (browser, state) = session.parts_mut()?;
    let prior = state.prior_state();
    let (width, height) = state.viewport();

    let logged = match action {
        ParsedAction::Say { utterance } => {
            let timestamp = state.replay.now();
            state
                .replay
                .finalize(ReplayEvent::chat(timestamp, Speaker::Navigator, utterance.as_str()))?;
            state.messages.push(ChatMessage::assistant(utterance.as_str()));
            info!(turn_index = state.turn_index, "navigator said");
            return Ok(DispatchOutcome {
                message: utterance.clone(),
                snapshot: None,
                screenshot: None,
            });
        }
        ParsedAction::Load { url } => {
            browser.navigate(url)?;
            BrowserAction::Load {
                metadata: Metadata {
                    url: url.clone(),
                    mouse_x: Some(0),
                    mouse_y: Some(0),
                    viewport_width: width,
                    viewport_height: height,
                },
                properties: LoadProperties { url: url.clone() },
            }
        }
        ParsedAction::Scroll { x, y } => {
            browser.execute_script(&format!("window.scrollTo({x}, {y});"))?;
            BrowserAction::Scroll {
                metadata: Metadata {
                    url: browser.current_url()?,
                    mouse_x: None,
                    mouse_y: None,
                    viewport_width: width,
                    viewport_height: height,
                },
                scroll_x: *x,
                scroll_y: *y,
            }
        }
        ParsedAction::Click { uid } => {
            let (target, metadata, element) = locate(browser, uid, (width, height))?;
            browser.click(&target)?;
            BrowserAction::Click { metadata, element }
        }
        ParsedAction::Submit { uid } => {
            let (target, metadata, element) = locate(browser, uid, (width, height))?;
            browser.submit(&target)?;
            BrowserAction::Submit { metadata, element }
        }
        ParsedAction::TextInput { text, uid } => {
            let (target, metadata, element) = locate(browser, uid, (width, height))?;
            browser.send_keys(&target, text)?;
            BrowserAction::TextInput {
                metadata,
                element,
                text: text.clone(),
            }
        }
        ParsedAction::Change { value, uid } => {
            let (target, metadata, element) = locate(browser, uid, (width, height))?;
            browser.send_keys(&target, value)?;
            BrowserAction::Change {
                metadata,
                element,
                value: value.clone(),
            }
        }
    };

    record_page_change(browser, state, prior, logged, action.to_string())
}

/// Resolves `uid` and captures the element as it is before being acted on;
/// a click may navigate away from it.
fn locate<'b, B: Browser>(
    browser: &'b B,
    uid: &str,
    (width, height): (u32, u32),
) -> Result<(B::Element<'b>, Metadata, TargetElement)> {
    let target = dom::resolve(browser, uid)?;
    let url = browser.current_url()?;
    let metadata = Metadata {
        url: url.clone(),
        mouse_x: Some(target.bbox.x.round() as i64),
        mouse_y: Some(target.bbox.y.round() as i64),
        viewport_width: width,
        viewport_height: height,
    };
    let element = TargetElement {
        url,
        attributes: target.attributes,
        bbox: target.bbox,
        tag_name: target.tag,
    };
    Ok((target.handle, metadata, element))
}

/// Shared tail of every page-changing action: wait, re-scan, snapshot, log,
/// advance the page counter, screenshot, then tell the user. Nothing after
/// the log write can fail the turn; a missing screenshot is only a warning.
fn record_page_change<B: Browser>(
    browser: &B,
    state: &mut SessionState,
    prior: Option<String>,
    logged: BrowserAction,
    message: String,
) -> Result<DispatchOutcome> {
    browser.wait_for_settle(state.config.settle_delay)?;

    let page = dom::scan(browser)?;
    let markup = browser.page_source()?;
    let snapshot = state.page_index;
    state.snapshots.save(snapshot, &markup, &page.bboxes)?;

    let intent = logged.intent();
    let timestamp = state.replay.now();
    state
        .replay
        .finalize(ReplayEvent::browser(timestamp, prior, logged))?;
    state.page_index += 1;
    state.elements = page.candidates;
    state.messages.push(ChatMessage::assistant(message.as_str()));

    let path = state.config.screenshot_path();
    let screenshot = match browser.screenshot(&path) {
        Ok(()) => {
            state.latest_screenshot = Some(path.clone());
            Some(path)
        }
        Err(e) => {
            warn!(error = %e, page_index = snapshot, "screenshot failed");
            None
        }
    };

    info!(
        intent,
        turn_index = state.turn_index,
        page_index = state.page_index,
        elements = page.bboxes.len(),
        "action recorded"
    );

    Ok(DispatchOutcome {
        message,
        snapshot: Some(snapshot),
        screenshot,
    })
}
