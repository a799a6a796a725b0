use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::{sleep, timeout};
use tracing::{error, info};

use crate::brain::PolicyOracle;
use crate::browser::BrowserContext;
use crate::config::AgentConfig;
use crate::error::{AgentError, AgentResult};
use crate::hands::ChromeSession;
use crate::orchestrator::Orchestrator;
use crate::types::{ActionHistoryEntry, Profile, Step};

/// Result of one guided session. `error` is set when the initial navigation failed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    pub steps: Vec<Step>,
    pub history: Vec<ActionHistoryEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Launches Chrome, runs every goal against `url`, and closes the browser.
/// Only a launch failure is returned as an error.
pub async fn run_session(
    config: &AgentConfig,
    oracle: Arc<dyn PolicyOracle>,
    url: &str,
    profile: &Profile,
    goals: &[String],
) -> AgentResult<SessionReport> {
    let session = ChromeSession::launch(&config.browser, &config.timings).await?;
    let report = run_goals(session.context(), oracle, config, url, profile, goals).await;
    drop(session);
    Ok(report)
}

/// Opens `url` in the given browser context and processes the goals in order.
pub async fn run_goals(
    context: Arc<dyn BrowserContext>,
    oracle: Arc<dyn PolicyOracle>,
    config: &AgentConfig,
    url: &str,
    profile: &Profile,
    goals: &[String],
) -> SessionReport {
    info!("Navigating to: {}", url);
    let navigation = match timeout(config.timings.navigation_timeout, context.open(url)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(_) => Err(format!(
            "timed out after {:?}",
            config.timings.navigation_timeout
        )),
    };
    if let Err(reason) = navigation {
        let e = AgentError::Navigation {
            url: url.to_string(),
            reason,
        };
        error!("Test execution failed: {}", e);
        return SessionReport {
            error: Some(e.to_string()),
            ..Default::default()
        };
    }
    sleep(config.timings.post_navigation_pause).await;

    let mut orchestrator = Orchestrator::new(context, oracle, config);
    let steps = orchestrator.run(goals, profile).await;

    let completed = steps.iter().filter(|s| s.completed()).count();
    info!("Session finished: {}/{} goals completed", completed, steps.len());

    SessionReport {
        steps,
        history: orchestrator.into_history(),
        error: None,
    }
}
