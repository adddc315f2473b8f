use anyhow::{Result, anyhow};
use std::path::PathBuf;
use std::time::Duration;

use crate::types::DEFAULT_NUM_CANDIDATES;

/// Runtime settings for one harness session.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub viewport_width: u32,
    pub viewport_height: u32,
    /// Pause after every browser effect before the page is re-scanned.
    pub settle_delay: Duration,
    pub num_candidates: usize,
    pub max_new_tokens: u32,
    pub pad_token_id: u32,
    pub max_prompt_chars: usize,
    pub headless: bool,
    pub chrome_path: Option<PathBuf>,
    pub retrieval_url: String,
    pub generation_url: String,
    pub api_token: Option<String>,
    /// Name the demonstration is filed under in candidate groups.
    pub demo_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./live_data"),
            viewport_width: 1600,
            viewport_height: 900,
            settle_delay: Duration::from_secs(3),
            num_candidates: DEFAULT_NUM_CANDIDATES,
            max_new_tokens: 256,
            pad_token_id: 2,
            max_prompt_chars: 12_000,
            headless: true,
            chrome_path: None,
            retrieval_url: String::new(),
            generation_url: String::new(),
            api_token: None,
            demo_name: "live_data".to_string(),
        }
    }
}

impl Config {
    /// Reads the service endpoints from the environment (`.env` is expected to
    /// be loaded already).
    pub fn from_env() -> Result<Self> {
        let retrieval_url =
            std::env::var("API_URL_DMR").map_err(|_| anyhow!("API_URL_DMR not set in environment"))?;
        let generation_url = std::env::var("API_URL_ACTION")
            .map_err(|_| anyhow!("API_URL_ACTION not set in environment"))?;

        Ok(Self {
            retrieval_url,
            generation_url,
            api_token: std::env::var("API_TOKEN").ok().filter(|t| !t.is_empty()),
            chrome_path: std::env::var_os("CHROME_PATH").map(PathBuf::from),
            ..Self::default()
        })
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self.demo_name = self
            .data_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "live_data".to_string());
        self
    }

    pub fn pages_dir(&self) -> PathBuf {
        self.data_dir.join("pages")
    }

    pub fn bboxes_dir(&self) -> PathBuf {
        self.data_dir.join("bboxes")
    }

    pub fn replay_path(&self) -> PathBuf {
        self.data_dir.join("replay.json")
    }

    pub fn screenshot_path(&self) -> PathBuf {
        self.data_dir.join("screenshot.png")
    }
}
