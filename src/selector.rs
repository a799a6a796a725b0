use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::browser::{FrameRef, PageDriver};
use crate::dom::PageObserver;
use crate::error::{AgentError, AgentResult};
use crate::types::{PageContext, StableId};

/// How the oracle referred to an element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectorRef {
    /// Position in a freshly extracted element list.
    Ordinal(usize),
    Stable(StableId),
    /// Anything else, tried verbatim as CSS in the main document.
    Raw(String),
}

impl SelectorRef {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if let Ok(index) = trimmed.parse::<usize>() {
            return SelectorRef::Ordinal(index);
        }
        match StableId::parse(trimmed) {
            Some(id) => SelectorRef::Stable(id),
            None => SelectorRef::Raw(trimmed.to_string()),
        }
    }
}

/// A frame-scoped selector verified to match at least one live node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub selector: String,
    pub frame: FrameRef,
    pub stable_id: Option<StableId>,
}

pub struct SelectorResolver {
    observer: Arc<PageObserver>,
}

impl SelectorResolver {
    pub fn new(observer: Arc<PageObserver>) -> Self {
        Self { observer }
    }

    /// Resolves an oracle reference against the live page.
    ///
    /// On failure the error carries a description of every element currently on
    /// the page so the oracle can correct itself next cycle.
    pub async fn resolve(&self, page: &dyn PageDriver, reference: &str) -> AgentResult<ResolvedTarget> {
        match self.try_resolve(page, reference).await {
            Ok(Some(target)) => {
                debug!("Resolved {:?} to {} in {:?}", reference, target.selector, target.frame);
                Ok(target)
            }
            Ok(None) => Err(self.not_found(page, reference).await),
            Err(e) => {
                warn!("Resolving {:?} failed: {:#}", reference, e);
                Err(self.not_found(page, reference).await)
            }
        }
    }

    async fn try_resolve(
        &self,
        page: &dyn PageDriver,
        reference: &str,
    ) -> anyhow::Result<Option<ResolvedTarget>> {
        let limit = self.observer.read_timeout();
        let stable_id = match SelectorRef::parse(reference) {
            SelectorRef::Ordinal(index) => {
                let context = self.observer.observe(page).await;
                match context.elements.into_iter().find(|e| e.index == index) {
                    Some(element) => element.stable_id,
                    None => return Ok(None),
                }
            }
            SelectorRef::Stable(id) => id,
            SelectorRef::Raw(css) => {
                if css.is_empty() {
                    return Ok(None);
                }
                let found = bounded(limit, page.count_matches(FrameRef::Main, &css)).await? > 0;
                return Ok(found.then(|| ResolvedTarget {
                    selector: css,
                    frame: FrameRef::Main,
                    stable_id: None,
                }));
            }
        };

        let selector = stable_id.selector();
        let frame = if stable_id.is_iframe() {
            match find_frame(page, &selector, limit).await? {
                Some(frame) => frame,
                None => return Ok(None),
            }
        } else {
            FrameRef::Main
        };

        if bounded(limit, page.count_matches(frame, &selector)).await? == 0 {
            return Ok(None);
        }
        Ok(Some(ResolvedTarget {
            selector,
            frame,
            stable_id: Some(stable_id),
        }))
    }

    async fn not_found(&self, page: &dyn PageDriver, reference: &str) -> AgentError {
        let context = self.observer.observe(page).await;
        info!(
            "Selector {:?} does not exist; {} valid elements on {}",
            reference,
            context.elements.len(),
            context.url
        );
        AgentError::SelectorNotFound {
            selector: reference.to_string(),
            hints: remediation_hints(&context),
        }
    }
}

/// First sub-frame holding a node that matches `selector`. Unreadable or silent
/// frames are skipped.
async fn find_frame(
    page: &dyn PageDriver,
    selector: &str,
    limit: Duration,
) -> anyhow::Result<Option<FrameRef>> {
    let count = bounded(limit, page.frame_count()).await?;
    for index in 0..count {
        let frame = FrameRef::Child(index);
        if let Ok(n) = bounded(limit, page.count_matches(frame, selector)).await {
            if n > 0 {
                return Ok(Some(frame));
            }
        }
    }
    Ok(None)
}

async fn bounded<T>(
    limit: Duration,
    call: impl Future<Output = anyhow::Result<T>>,
) -> anyhow::Result<T> {
    timeout(limit, call)
        .await
        .map_err(|_| anyhow!("page did not answer within {:?}", limit))?
}

pub fn remediation_hints(context: &PageContext) -> Vec<String> {
    context.elements.iter().map(|e| e.describe()).collect()
}
