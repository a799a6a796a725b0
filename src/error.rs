use std::time::Duration;

use thiserror::Error;

use crate::types::ActionKind;

/// Classified failures of the action loop.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The reference matched nothing on any observed frame. `hints` lists what does exist.
    #[error("Selector \"{selector}\" does not exist on the page")]
    SelectorNotFound { selector: String, hints: Vec<String> },

    #[error("Value required for {0} action")]
    ValueRequired(ActionKind),

    #[error("No resolved target for {0} action")]
    MissingTarget(ActionKind),

    #[error("Browser error: {0}")]
    Browser(#[from] anyhow::Error),

    #[error("{operation} did not finish within {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Policy oracle error: {0}")]
    Oracle(String),

    #[error("Policy oracle did not answer within {0} seconds")]
    OracleTimeout(u64),

    #[error("No open page in the browser context")]
    NoActivePage,

    #[error("Navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    #[error("Browser launch failed: {0}")]
    Launch(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl AgentError {
    /// Resolution failures are fed back to the oracle as remediation hints.
    pub fn is_resolution_failure(&self) -> bool {
        matches!(self, AgentError::SelectorNotFound { .. })
    }
}

pub type AgentResult<T> = Result<T, AgentError>;
