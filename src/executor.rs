use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::browser::{self, BrowserContext, PageDriver};
use crate::config::Timings;
use crate::dom;
use crate::error::{AgentError, AgentResult};
use crate::selector::ResolvedTarget;
use crate::types::{ActionCandidate, ActionKind};

/// What happened when an action ran.
pub struct ActionOutcome {
    pub success: bool,
    pub error: Option<String>,
    /// A tab opened by the action, already given a chance to load.
    pub new_page: Option<Arc<dyn PageDriver>>,
}

pub struct ActionExecutor {
    timings: Timings,
}

impl ActionExecutor {
    pub fn new(timings: Timings) -> Self {
        Self { timings }
    }

    /// Runs `action` against `target` and writes the result back onto the candidate.
    /// Faults never escape; they become a failed outcome.
    pub async fn execute(
        &self,
        context: &dyn BrowserContext,
        page: &dyn PageDriver,
        target: Option<&ResolvedTarget>,
        action: &mut ActionCandidate,
    ) -> ActionOutcome {
        match self.perform(context, page, target, action).await {
            Ok(new_page) => {
                action.success = true;
                action.error = None;
                ActionOutcome {
                    success: true,
                    error: None,
                    new_page,
                }
            }
            Err(e) => {
                let message = e.to_string();
                warn!("Action {} on {:?} failed: {}", action.action, action.selector, message);
                action.success = false;
                action.error = Some(message.clone());
                ActionOutcome {
                    success: false,
                    error: Some(message),
                    new_page: None,
                }
            }
        }
    }

    async fn perform(
        &self,
        context: &dyn BrowserContext,
        page: &dyn PageDriver,
        target: Option<&ResolvedTarget>,
        action: &ActionCandidate,
    ) -> AgentResult<Option<Arc<dyn PageDriver>>> {
        match action.action {
            ActionKind::Wait => {
                sleep(self.timings.wait_action_delay).await;
                Ok(None)
            }
            ActionKind::Click => {
                let target = target.ok_or(AgentError::MissingTarget(ActionKind::Click))?;
                self.click(context, page, target).await
            }
            ActionKind::Fill => {
                let value = required_value(action)?;
                let target = target.ok_or(AgentError::MissingTarget(ActionKind::Fill))?;
                if let Err(e) = self
                    .bounded("focus", page.focus(target.frame, &target.selector))
                    .await
                {
                    debug!("Focus before fill failed, continuing: {:#}", e);
                }
                self.bounded("fill", page.fill(target.frame, &target.selector, value))
                    .await?;
                Ok(None)
            }
            ActionKind::Select => {
                let value = required_value(action)?;
                let target = target.ok_or(AgentError::MissingTarget(ActionKind::Select))?;
                self.bounded(
                    "select",
                    page.select_option(target.frame, &target.selector, value),
                )
                .await?;
                Ok(None)
            }
        }
    }

    /// Clicks while watching for a new tab. Links with `target="_blank"` get the
    /// long window; other clicks a short one, since scripts can open tabs too.
    /// A failed click returns at once instead of waiting out the window.
    async fn click(
        &self,
        context: &dyn BrowserContext,
        page: &dyn PageDriver,
        target: &ResolvedTarget,
    ) -> AgentResult<Option<Arc<dyn PageDriver>>> {
        let opens_tab = matches!(
            self.bounded("link lookup", page.link_target(target.frame, &target.selector)).await,
            Ok(Some(ref t)) if t.eq_ignore_ascii_case("_blank")
        );
        let window = if opens_tab {
            self.timings.new_tab_timeout
        } else {
            self.timings.script_tab_window
        };

        let known = self.bounded("page listing", browser::page_ids(context)).await?;
        let click = self.bounded("click", page.click(target.frame, &target.selector));
        let watch = wait_for_new_page(context, &known, window, self.timings.new_page_poll);
        tokio::pin!(click, watch);

        let mut clicked = None;
        let mut found = None;
        tokio::select! {
            result = &mut click => clicked = Some(result),
            opened = &mut watch => found = Some(opened),
        }
        match clicked {
            Some(result) => result?,
            None => click.await?,
        }
        let opened = match found {
            Some(page) => page,
            None => watch.await,
        };

        let Some(new_page) = opened else {
            if opens_tab {
                debug!("Link {} declared a new tab but none appeared", target.selector);
            }
            return Ok(None);
        };

        dom::settle(
            new_page.as_ref(),
            self.timings.new_page_load_timeout,
            self.timings.settle_poll,
        )
        .await;
        let url = match timeout(self.timings.action_timeout, new_page.url()).await {
            Ok(Ok(url)) => url,
            _ => "unknown".into(),
        };
        info!("New page detected: {}", url);
        Ok(Some(new_page))
    }

    /// Runs one page call under the action timeout.
    async fn bounded<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = anyhow::Result<T>>,
    ) -> AgentResult<T> {
        match timeout(self.timings.action_timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(AgentError::Timeout {
                operation,
                after: self.timings.action_timeout,
            }),
        }
    }
}

fn required_value(action: &ActionCandidate) -> AgentResult<&str> {
    match action.value.as_deref() {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(AgentError::ValueRequired(action.action)),
    }
}

/// Polls the context for a page not in `known` until `window` elapses.
pub async fn wait_for_new_page(
    context: &dyn BrowserContext,
    known: &HashSet<String>,
    window: Duration,
    poll: Duration,
) -> Option<Arc<dyn PageDriver>> {
    let watch = async {
        loop {
            if let Ok(pages) = context.pages().await {
                if let Some(page) = pages.into_iter().rev().find(|p| !known.contains(&p.id())) {
                    return page;
                }
            }
            sleep(poll).await;
        }
    };
    timeout(window, watch).await.ok()
}
