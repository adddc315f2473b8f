use tracing::debug;

use crate::error::{HarnessError, Result};
use crate::hands::Browser;
use crate::types::{
    ATTRIBUTE_ALLOW_LIST, BboxTable, BoundingBox, ElementAttributes, ElementRecord,
    INTERACTIVE_TAGS, UID_ATTRIBUTE,
};

const ELEMENT_TEXT_MAX_CHARS: usize = 100;

/// Result of one pass over the live DOM.
#[derive(Debug, Clone, Default)]
pub struct PageScan {
    pub bboxes: BboxTable,
    /// Interactive elements in document order.
    pub candidates: Vec<ElementRecord>,
}

/// A uid resolved back to a live element.
pub struct ResolvedElement<E> {
    pub handle: E,
    pub attributes: ElementAttributes,
    pub bbox: BoundingBox,
    pub tag: String,
}

/// Tags every element on the page with a uid (keeping any uid it already
/// has) and returns the uid -> bbox table.
pub fn ensure_uids<B: Browser>(browser: &B) -> Result<BboxTable> {
    Ok(scan(browser)?.bboxes)
}

/// Same walk as [`ensure_uids`], also collecting the interactive elements
/// that become next turn's candidates.
pub fn scan<B: Browser>(browser: &B) -> Result<PageScan> {
    let mut page = PageScan::default();
    let mut assigned = 0usize;

    for el in browser.find_all_elements()? {
        let uid = match browser.get_attribute(&el, UID_ATTRIBUTE)? {
            Some(uid) if !uid.is_empty() => uid,
            _ => {
                let uid = new_uid();
                browser.set_attribute(&el, UID_ATTRIBUTE, &uid)?;
                assigned += 1;
                uid
            }
        };
        let bbox = BoundingBox::from_rect(browser.get_rect(&el)?);

        let tag = browser.tag_name(&el)?;
        if is_interactive(browser, &el, &tag)? {
            let text = shorten(&browser.text_content(&el)?, ELEMENT_TEXT_MAX_CHARS);
            page.candidates.push(ElementRecord {
                uid: uid.clone(),
                tag,
                text,
                attributes: read_attributes(browser, &el, &uid)?,
                bbox,
            });
        }

        page.bboxes.insert(uid, bbox);
    }

    debug!(
        elements = page.bboxes.len(),
        candidates = page.candidates.len(),
        assigned,
        "page scanned"
    );
    Ok(page)
}

/// Finds the element carrying `uid` and reads what the replay log needs
/// about it.
pub fn resolve<'b, B: Browser>(browser: &'b B, uid: &str) -> Result<ResolvedElement<B::Element<'b>>> {
    let handle = browser
        .find_element_by_uid(uid)?
        .ok_or_else(|| HarnessError::ElementNotFound(uid.to_string()))?;

    let attributes = read_attributes(browser, &handle, uid)?;
    let bbox = BoundingBox::from_rect(browser.get_rect(&handle)?);
    let tag = browser.tag_name(&handle)?;

    Ok(ResolvedElement {
        handle,
        attributes,
        bbox,
        tag,
    })
}

fn read_attributes<B: Browser>(
    browser: &B,
    el: &B::Element<'_>,
    uid: &str,
) -> Result<ElementAttributes> {
    let mut attributes = ElementAttributes::new();
    for name in ATTRIBUTE_ALLOW_LIST {
        if let Some(value) = browser.get_attribute(el, name)? {
            attributes.insert(name.to_string(), value);
        }
    }
    attributes.insert(UID_ATTRIBUTE.to_string(), uid.to_string());
    Ok(attributes)
}

fn is_interactive<B: Browser>(browser: &B, el: &B::Element<'_>, tag: &str) -> Result<bool> {
    if INTERACTIVE_TAGS.contains(&tag) {
        return Ok(true);
    }
    for name in ["role", "onclick", "tabindex"] {
        if browser.get_attribute(el, name)?.is_some() {
            return Ok(true);
        }
    }
    Ok(false)
}

/// 18 hex characters in `8-4-4` groups.
fn new_uid() -> String {
    format!(
        "{:08x}-{:04x}-{:04x}",
        rand::random::<u32>(),
        rand::random::<u16>(),
        rand::random::<u16>()
    )
}

pub(crate) fn shorten(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    let mut cut: String = collapsed.chars().take(max_chars.saturating_sub(3)).collect();
    cut.push_str("...");
    cut
}
