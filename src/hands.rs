use anyhow::{Context, Result};
use headless_chrome::browser::tab::NoElementFound;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Browser as ChromeProcess, Element, LaunchOptions, Tab};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::types::{Rect, UID_ATTRIBUTE};

/// What the harness needs from a browser. Element handles are borrowed from
/// the browser, so they never outlive the page they were found on.
pub trait Browser {
    type Element<'a>
    where
        Self: 'a;

    fn navigate(&self, url: &str) -> Result<()>;
    fn find_all_elements(&self) -> Result<Vec<Self::Element<'_>>>;
    fn find_element_by_uid(&self, uid: &str) -> Result<Option<Self::Element<'_>>>;
    fn get_attribute(&self, el: &Self::Element<'_>, name: &str) -> Result<Option<String>>;
    fn set_attribute(&self, el: &Self::Element<'_>, name: &str, value: &str) -> Result<()>;
    fn get_rect(&self, el: &Self::Element<'_>) -> Result<Rect>;
    fn tag_name(&self, el: &Self::Element<'_>) -> Result<String>;
    fn text_content(&self, el: &Self::Element<'_>) -> Result<String>;
    fn click(&self, el: &Self::Element<'_>) -> Result<()>;
    fn send_keys(&self, el: &Self::Element<'_>, text: &str) -> Result<()>;
    fn submit(&self, el: &Self::Element<'_>) -> Result<()>;
    fn execute_script(&self, js: &str) -> Result<Value>;
    fn page_source(&self) -> Result<String>;
    fn screenshot(&self, path: &Path) -> Result<()>;
    fn current_url(&self) -> Result<String>;

    /// Blocks until the page has had a chance to react to the last effect.
    fn wait_for_settle(&self, delay: Duration) -> Result<()> {
        std::thread::sleep(delay);
        Ok(())
    }

    fn close(self) -> Result<()>
    where
        Self: Sized;
}

/// A real Chrome instance driven over CDP.
pub struct ChromeBrowser {
    _process: ChromeProcess,
    tab: Arc<Tab>,
}

impl ChromeBrowser {
    pub fn launch(config: &Config) -> Result<Self> {
        let path = config.chrome_path.clone().or_else(find_chrome);
        if let Some(ref p) = path {
            info!(path = %p.display(), "using chrome executable");
        }

        let options = LaunchOptions {
            headless: config.headless,
            sandbox: false,
            path,
            window_size: Some((config.viewport_width, config.viewport_height)),
            args: vec![
                std::ffi::OsStr::new("--no-first-run"),
                std::ffi::OsStr::new("--no-default-browser-check"),
                std::ffi::OsStr::new("--disable-infobars"),
            ],
            idle_browser_timeout: Duration::from_secs(600),
            ..Default::default()
        };

        info!(headless = config.headless, "starting chrome");
        let process = ChromeProcess::new(options).context("browser launch failed")?;
        let tab = process.new_tab()?;
        tab.navigate_to("about:blank")?;
        info!("chrome ready");

        Ok(Self {
            _process: process,
            tab,
        })
    }

    fn call_for_string(
        &self,
        el: &Element<'_>,
        function: &str,
        args: Vec<Value>,
    ) -> Result<Option<String>> {
        let result = el.call_js_fn(function, args, false)?;
        Ok(result.value.and_then(|v| v.as_str().map(String::from)))
    }
}

impl Browser for ChromeBrowser {
    type Element<'a> = Element<'a>;

    fn navigate(&self, url: &str) -> Result<()> {
        self.tab
            .navigate_to(url)
            .with_context(|| format!("failed to open URL: {url}"))?;
        self.tab
            .wait_until_navigated()
            .context("navigation did not complete")?;
        Ok(())
    }

    fn find_all_elements(&self) -> Result<Vec<Element<'_>>> {
        Ok(self.tab.find_elements("*")?)
    }

    fn find_element_by_uid(&self, uid: &str) -> Result<Option<Element<'_>>> {
        let selector = format!("[{UID_ATTRIBUTE}=\"{}\"]", css_attr_escape(uid));
        let found = absent_as_none(self.tab.find_element(&selector))
            .with_context(|| format!("uid lookup failed: {uid}"))?;
        if found.is_none() {
            debug!(uid, "no element carries uid");
        }
        Ok(found)
    }

    fn get_attribute(&self, el: &Element<'_>, name: &str) -> Result<Option<String>> {
        self.call_for_string(
            el,
            "function (name) { return this.getAttribute(name); }",
            vec![json!(name)],
        )
    }

    fn set_attribute(&self, el: &Element<'_>, name: &str, value: &str) -> Result<()> {
        el.call_js_fn(
            "function (name, value) { this.setAttribute(name, value); }",
            vec![json!(name), json!(value)],
            false,
        )?;
        Ok(())
    }

    fn get_rect(&self, el: &Element<'_>) -> Result<Rect> {
        let raw = self
            .call_for_string(
                el,
                "function () { const r = this.getBoundingClientRect(); \
                 return JSON.stringify({x: r.x + window.scrollX, y: r.y + window.scrollY, \
                 width: r.width, height: r.height}); }",
                vec![],
            )?
            .unwrap_or_default();
        Ok(serde_json::from_str(&raw).context("unreadable element rect")?)
    }

    fn tag_name(&self, el: &Element<'_>) -> Result<String> {
        Ok(self
            .call_for_string(el, "function () { return this.tagName.toLowerCase(); }", vec![])?
            .unwrap_or_default())
    }

    fn text_content(&self, el: &Element<'_>) -> Result<String> {
        Ok(self
            .call_for_string(
                el,
                "function () { return (this.innerText || this.value || this.textContent || '').trim(); }",
                vec![],
            )?
            .unwrap_or_default())
    }

    fn click(&self, el: &Element<'_>) -> Result<()> {
        el.click()?;
        Ok(())
    }

    fn send_keys(&self, el: &Element<'_>, text: &str) -> Result<()> {
        el.type_into(text)?;
        Ok(())
    }

    fn submit(&self, el: &Element<'_>) -> Result<()> {
        el.call_js_fn(
            "function () { const f = this.form || (this.tagName === 'FORM' ? this : null); \
             if (!f) { throw new Error('element is not inside a form'); } \
             if (f.requestSubmit) { f.requestSubmit(); } else { f.submit(); } }",
            vec![],
            false,
        )?;
        Ok(())
    }

    fn execute_script(&self, js: &str) -> Result<Value> {
        let result = self.tab.evaluate(js, false)?;
        Ok(result.value.unwrap_or(Value::Null))
    }

    fn page_source(&self) -> Result<String> {
        Ok(self.tab.get_content()?)
    }

    fn screenshot(&self, path: &Path) -> Result<()> {
        let png = self
            .tab
            .capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true)?;
        std::fs::write(path, &png)
            .with_context(|| format!("failed to write screenshot to {}", path.display()))?;
        Ok(())
    }

    fn current_url(&self) -> Result<String> {
        Ok(self.tab.get_url())
    }

    fn wait_for_settle(&self, delay: Duration) -> Result<()> {
        if let Err(e) = self.tab.wait_until_navigated() {
            warn!(error = %e, "page did not report navigation complete");
        }
        std::thread::sleep(delay);
        Ok(())
    }

    fn close(self) -> Result<()> {
        if let Err(e) = self.tab.close(true) {
            warn!(error = %e, "failed to close tab cleanly");
        }
        // Dropping the process handle shuts Chrome down.
        Ok(())
    }
}

/// Only a selector miss means "absent"; transport and protocol errors pass
/// through.
fn absent_as_none<T>(found: Result<T>) -> Result<Option<T>> {
    match found {
        Ok(el) => Ok(Some(el)),
        Err(e) if e.is::<NoElementFound>() => Ok(None),
        Err(e) => Err(e),
    }
}

fn css_attr_escape(input: &str) -> String {
    input.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Well-known Chrome locations; `None` lets headless_chrome search on its own.
fn find_chrome() -> Option<PathBuf> {
    let mut candidates = vec![
        PathBuf::from(r"C:\Program Files\Google\Chrome\Application\chrome.exe"),
        PathBuf::from(r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe"),
        PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
    ];
    if let Some(local) = dirs::data_local_dir() {
        candidates.push(
            local
                .join("Google")
                .join("Chrome")
                .join("Application")
                .join("chrome.exe"),
        );
    }

    candidates.into_iter().find(|p| p.exists())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_a_selector_miss_counts_as_absent() {
        assert_eq!(absent_as_none(Ok(7)).unwrap(), Some(7));
        assert_eq!(
            absent_as_none::<u8>(Err(NoElementFound {}.into())).unwrap(),
            None
        );
        let err = absent_as_none::<u8>(Err(anyhow::anyhow!("connection closed"))).unwrap_err();
        assert!(err.to_string().contains("connection closed"));
    }

    #[test]
    fn uid_selector_escapes_quotes() {
        assert_eq!(css_attr_escape(r#"a"b"#), r#"a\"b"#);
        assert_eq!(css_attr_escape(r"a\b"), r"a\\b");
        assert_eq!(css_attr_escape("3f2a9c1e-77d0-4b1a"), "3f2a9c1e-77d0-4b1a");
    }
}
