use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// DOM attribute that carries the stable per-element identifier.
pub const UID_ATTRIBUTE: &str = "data-webtasks-id";

/// Attributes copied from a target element into the replay log.
pub const ATTRIBUTE_ALLOW_LIST: [&str; 6] = ["class", "title", "href", "aria-label", "d", "src"];

/// Tags that are always offered to the model as candidates.
pub const INTERACTIVE_TAGS: [&str; 7] = [
    "a", "button", "input", "textarea", "select", "option", "label",
];

pub const DEFAULT_NUM_CANDIDATES: usize = 10;
pub const CANDIDATE_DOC_MAX_CHARS: usize = 300;
pub const NUM_PREV_TURNS: usize = 5;
pub const NUM_UTTERANCES: usize = 5;

/// Position and size of an element as reported by the browser.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Element geometry in the demonstration format. Every edge is derived from
/// the rect so the fields can never disagree.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
    pub left: f64,
}

impl BoundingBox {
    pub fn from_rect(rect: Rect) -> Self {
        Self {
            x: rect.x,
            y: rect.y,
            width: rect.width,
            height: rect.height,
            top: rect.y,
            right: rect.x + rect.width,
            bottom: rect.y + rect.height,
            left: rect.x,
        }
    }
}

impl From<Rect> for BoundingBox {
    fn from(rect: Rect) -> Self {
        Self::from_rect(rect)
    }
}

/// uid -> bounding box for every element of one page.
pub type BboxTable = BTreeMap<String, BoundingBox>;

/// Allow-listed attributes of a single element, uid included.
pub type ElementAttributes = BTreeMap<String, String>;

/// An interactive element seen during the last scan; the candidate pool for
/// the next model query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementRecord {
    pub uid: String,
    pub tag: String,
    pub text: String,
    pub attributes: ElementAttributes,
    pub bbox: BoundingBox,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A message shown in the chat panel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}
