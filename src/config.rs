use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::AgentError;
use crate::types::{self, DEFAULT_ACTION_BUDGET};

pub const DEFAULT_MODEL: &str = "gpt-4o-2024-08-06";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_PORT: u16 = 4000;

/// Pauses and bounded waits used by the observer, executor and loop.
#[derive(Debug, Clone, PartialEq)]
pub struct Timings {
    pub settle_timeout: Duration,
    pub settle_poll: Duration,
    pub new_tab_timeout: Duration,
    pub script_tab_window: Duration,
    pub new_page_poll: Duration,
    pub new_page_load_timeout: Duration,
    pub wait_action_delay: Duration,
    pub inter_action_delay: Duration,
    pub error_backoff: Duration,
    pub post_navigation_pause: Duration,
    pub navigation_timeout: Duration,
    pub action_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            settle_timeout: types::SETTLE_TIMEOUT,
            settle_poll: Duration::from_millis(250),
            new_tab_timeout: types::NEW_TAB_TIMEOUT,
            script_tab_window: types::SCRIPT_TAB_WINDOW,
            new_page_poll: Duration::from_millis(100),
            new_page_load_timeout: types::NEW_PAGE_LOAD_TIMEOUT,
            wait_action_delay: types::WAIT_ACTION_DELAY,
            inter_action_delay: types::INTER_ACTION_DELAY,
            error_backoff: types::ERROR_BACKOFF,
            post_navigation_pause: types::POST_NAVIGATION_PAUSE,
            navigation_timeout: types::NAVIGATION_TIMEOUT,
            action_timeout: types::ACTION_TIMEOUT,
        }
    }
}

impl Timings {
    /// Millisecond-scale waits for driving the loop against an in-memory browser.
    pub fn instant() -> Self {
        let tick = Duration::from_millis(1);
        Self {
            settle_timeout: Duration::from_millis(20),
            settle_poll: tick,
            new_tab_timeout: Duration::from_millis(30),
            script_tab_window: Duration::from_millis(10),
            new_page_poll: tick,
            new_page_load_timeout: Duration::from_millis(20),
            wait_action_delay: tick,
            inter_action_delay: tick,
            error_backoff: tick,
            post_navigation_pause: tick,
            navigation_timeout: Duration::from_millis(100),
            action_timeout: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrowserConfig {
    pub headless: bool,
    pub chrome_path: Option<PathBuf>,
    /// Attach to an already running Chrome instead of launching one.
    pub debug_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OracleConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    pub action_budget: usize,
    pub timings: Timings,
    pub browser: BrowserConfig,
    pub oracle: OracleConfig,
    pub port: u16,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            action_budget: DEFAULT_ACTION_BUDGET,
            timings: Timings::default(),
            browser: BrowserConfig {
                headless: false,
                chrome_path: None,
                debug_url: None,
            },
            oracle: OracleConfig {
                api_key: None,
                model: DEFAULT_MODEL.to_string(),
                base_url: DEFAULT_BASE_URL.to_string(),
                timeout: Duration::from_secs(60),
            },
            port: DEFAULT_PORT,
        }
    }
}

impl AgentConfig {
    /// Reads the process environment. Call `dotenvy::dotenv()` first to pick up `.env`.
    pub fn from_env() -> Result<Self, AgentError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AgentError> {
        let mut config = Self::default();

        if let Some(budget) = parse_var::<usize>(&lookup, "AGENT_ACTION_BUDGET")? {
            if budget == 0 {
                return Err(AgentError::Config(
                    "AGENT_ACTION_BUDGET must be at least 1".into(),
                ));
            }
            config.action_budget = budget;
        }
        if let Some(headless) = parse_var::<bool>(&lookup, "AGENT_HEADLESS")? {
            config.browser.headless = headless;
        }
        if let Some(port) = parse_var::<u16>(&lookup, "AGENT_PORT")? {
            config.port = port;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "AGENT_ORACLE_TIMEOUT_SECS")? {
            config.oracle.timeout = Duration::from_secs(secs);
        }

        config.browser.chrome_path = non_empty(&lookup, "CHROME_PATH").map(PathBuf::from);
        config.browser.debug_url = non_empty(&lookup, "CHROME_DEBUG_URL");
        config.oracle.api_key = non_empty(&lookup, "OPENAI_API_KEY");
        if let Some(model) = non_empty(&lookup, "OPENAI_MODEL") {
            config.oracle.model = model;
        }
        if let Some(base_url) = non_empty(&lookup, "OPENAI_BASE_URL") {
            config.oracle.base_url = base_url.trim_end_matches('/').to_string();
        }

        Ok(config)
    }
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, AgentError> {
    match non_empty(lookup, key) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| AgentError::Config(format!("{key}={raw} is not a valid value"))),
    }
}
