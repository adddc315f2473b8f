//! In-memory browser for unit tests.

use anyhow::{Result, bail};
use serde_json::Value;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use crate::config::Config;
use crate::hands::Browser;
use crate::session::Session;
use crate::types::Rect;

#[derive(Debug, Clone)]
pub struct StubNode {
    pub tag: String,
    pub text: String,
    pub attributes: BTreeMap<String, String>,
    pub rect: Rect,
}

impl StubNode {
    pub fn new(tag: &str, text: &str, rect: (f64, f64, f64, f64)) -> Self {
        Self {
            tag: tag.to_string(),
            text: text.to_string(),
            attributes: BTreeMap::new(),
            rect: Rect {
                x: rect.0,
                y: rect.1,
                width: rect.2,
                height: rect.3,
            },
        }
    }

    pub fn attr(mut self, name: &str, value: &str) -> Self {
        self.attributes.insert(name.to_string(), value.to_string());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct StubPage {
    pub url: String,
    pub nodes: Vec<StubNode>,
}

impl StubPage {
    pub fn new(url: &str, nodes: Vec<StubNode>) -> Self {
        Self {
            url: url.to_string(),
            nodes,
        }
    }

    fn html(&self) -> String {
        let body: String = self
            .nodes
            .iter()
            .map(|n| {
                let attrs: String = n
                    .attributes
                    .iter()
                    .map(|(k, v)| format!(" {k}=\"{v}\""))
                    .collect();
                format!("<{0}{1}>{2}</{0}>", n.tag, attrs, n.text)
            })
            .collect();
        format!("<html><body>{body}</body></html>")
    }
}

#[derive(Default)]
struct StubState {
    sites: HashMap<String, StubPage>,
    current: StubPage,
    log: Vec<String>,
    screenshots_fail: bool,
}

/// A browser whose pages are registered up front. Links (`a` with `href`)
/// navigate when clicked; everything else only records the effect.
#[derive(Default)]
pub struct StubBrowser {
    state: RefCell<StubState>,
}

impl StubBrowser {
    pub fn new() -> Self {
        let browser = Self::default();
        browser.state.borrow_mut().current = StubPage::new("about:blank", Vec::new());
        browser
    }

    pub fn with_site(self, page: StubPage) -> Self {
        self.state
            .borrow_mut()
            .sites
            .insert(page.url.clone(), page);
        self
    }

    /// Every later screenshot fails, as a crashed renderer would.
    pub fn failing_screenshots(self) -> Self {
        self.state.borrow_mut().screenshots_fail = true;
        self
    }

    /// Effects performed so far, e.g. `click:button`.
    pub fn effects(&self) -> Vec<String> {
        self.state.borrow().log.clone()
    }

    pub fn node_attribute(&self, index: usize, name: &str) -> Option<String> {
        self.state
            .borrow()
            .current
            .nodes
            .get(index)
            .and_then(|n| n.attributes.get(name).cloned())
    }

    pub fn push_node(&self, node: StubNode) {
        self.state.borrow_mut().current.nodes.push(node);
    }

    fn with_node<T>(&self, el: usize, f: impl FnOnce(&StubNode) -> T) -> Result<T> {
        let state = self.state.borrow();
        match state.current.nodes.get(el) {
            Some(node) => Ok(f(node)),
            None => bail!("stale element handle {el}"),
        }
    }

    fn go(&self, url: &str) {
        let mut state = self.state.borrow_mut();
        let page = state
            .sites
            .get(url)
            .cloned()
            .unwrap_or_else(|| StubPage::new(url, Vec::new()));
        state.current = page;
    }
}

impl Browser for StubBrowser {
    type Element<'a> = usize;

    fn navigate(&self, url: &str) -> Result<()> {
        self.state.borrow_mut().log.push(format!("navigate:{url}"));
        self.go(url);
        Ok(())
    }

    fn find_all_elements(&self) -> Result<Vec<usize>> {
        Ok((0..self.state.borrow().current.nodes.len()).collect())
    }

    fn find_element_by_uid(&self, uid: &str) -> Result<Option<usize>> {
        Ok(self
            .state
            .borrow()
            .current
            .nodes
            .iter()
            .position(|n| n.attributes.get(crate::types::UID_ATTRIBUTE).map(String::as_str) == Some(uid)))
    }

    fn get_attribute(&self, el: &usize, name: &str) -> Result<Option<String>> {
        self.with_node(*el, |n| n.attributes.get(name).cloned())
    }

    fn set_attribute(&self, el: &usize, name: &str, value: &str) -> Result<()> {
        let mut state = self.state.borrow_mut();
        match state.current.nodes.get_mut(*el) {
            Some(node) => {
                node.attributes.insert(name.to_string(), value.to_string());
                Ok(())
            }
            None => bail!("stale element handle {el}"),
        }
    }

    fn get_rect(&self, el: &usize) -> Result<Rect> {
        self.with_node(*el, |n| n.rect)
    }

    fn tag_name(&self, el: &usize) -> Result<String> {
        self.with_node(*el, |n| n.tag.clone())
    }

    fn text_content(&self, el: &usize) -> Result<String> {
        self.with_node(*el, |n| n.text.clone())
    }

    fn click(&self, el: &usize) -> Result<()> {
        let (tag, href) = self.with_node(*el, |n| (n.tag.clone(), n.attributes.get("href").cloned()))?;
        self.state.borrow_mut().log.push(format!("click:{tag}"));
        if let ("a", Some(href)) = (tag.as_str(), href) {
            self.go(&href);
        }
        Ok(())
    }

    fn send_keys(&self, el: &usize, text: &str) -> Result<()> {
        let tag = self.tag_name(el)?;
        let mut state = self.state.borrow_mut();
        state.log.push(format!("keys:{tag}:{text}"));
        if let Some(node) = state.current.nodes.get_mut(*el) {
            node.attributes
                .entry("value".to_string())
                .or_default()
                .push_str(text);
        }
        Ok(())
    }

    fn submit(&self, el: &usize) -> Result<()> {
        let tag = self.tag_name(el)?;
        self.state.borrow_mut().log.push(format!("submit:{tag}"));
        Ok(())
    }

    fn execute_script(&self, js: &str) -> Result<Value> {
        self.state.borrow_mut().log.push(format!("script:{js}"));
        Ok(Value::Null)
    }

    fn page_source(&self) -> Result<String> {
        Ok(self.state.borrow().current.html())
    }

    fn screenshot(&self, path: &Path) -> Result<()> {
        if self.state.borrow().screenshots_fail {
            bail!("screenshot capture failed");
        }
        std::fs::write(path, b"\x89PNG stub")?;
        Ok(())
    }

    fn current_url(&self) -> Result<String> {
        Ok(self.state.borrow().current.url.clone())
    }

    fn wait_for_settle(&self, _delay: Duration) -> Result<()> {
        Ok(())
    }

    fn close(self) -> Result<()> {
        Ok(())
    }
}

/// A small search page: a query box, a submit button and two result links.
pub fn search_site() -> StubBrowser {
    StubBrowser::new()
        .with_site(StubPage::new(
            "https://example.com",
            vec![
                StubNode::new("html", "", (0.0, 0.0, 1600.0, 900.0)),
                StubNode::new("form", "", (100.0, 80.0, 600.0, 60.0)).attr("class", "search"),
                StubNode::new("input", "", (110.0, 90.0, 400.0, 30.0))
                    .attr("title", "Search")
                    .attr("aria-label", "Search query"),
                StubNode::new("button", "Go", (520.0, 90.0, 60.0, 30.0)).attr("class", "btn primary"),
                StubNode::new("a", "Rust language", (100.0, 200.0, 200.0, 20.0))
                    .attr("href", "https://example.com/rust"),
                StubNode::new("a", "Cargo book", (100.0, 240.0, 180.0, 20.0))
                    .attr("href", "https://example.com/cargo"),
            ],
        ))
        .with_site(StubPage::new(
            "https://example.com/rust",
            vec![
                StubNode::new("h1", "Rust", (0.0, 0.0, 800.0, 40.0)),
                StubNode::new("a", "Install", (0.0, 60.0, 80.0, 20.0)).attr("href", "https://example.com/install"),
            ],
        ))
}

/// A fresh session over [`search_site`] writing under `dir/live_data`.
pub fn stub_session(dir: &Path) -> Session<StubBrowser> {
    stub_session_over(dir, search_site())
}

pub fn stub_session_over(dir: &Path, browser: StubBrowser) -> Session<StubBrowser> {
    let config = Config::default().with_data_dir(dir.join("live_data"));
    Session::init(config, browser).expect("stub session")
}
