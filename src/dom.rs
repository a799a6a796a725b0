use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::browser::{FrameRef, PageDriver, RawElement};
use crate::config::Timings;
use crate::types::{ClickableElement, FrameKind, PageContext, StableId};

/// Extracts the interactive surface of a page and its sub-frames, tagging every
/// node with a stable identifier on first sight.
///
/// Each document claims one namespace the first time it is observed, so
/// identifiers never collide across frames or pages handled by the same observer.
pub struct PageObserver {
    settle_timeout: Duration,
    settle_poll: Duration,
    /// Bound on each page call, and on each frame as a whole.
    read_timeout: Duration,
    next_namespace: AtomicU64,
}

impl PageObserver {
    pub fn new(timings: &Timings) -> Self {
        Self {
            settle_timeout: timings.settle_timeout,
            settle_poll: timings.settle_poll,
            read_timeout: timings.action_timeout,
            next_namespace: AtomicU64::new(0),
        }
    }

    /// Bound applied to each page call made while observing.
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Settles the page, then extracts main-document elements followed by every sub-frame's.
    /// A frame that cannot be read in time contributes nothing.
    pub async fn observe(&self, page: &dyn PageDriver) -> PageContext {
        settle(page, self.settle_timeout, self.settle_poll).await;

        let url = match timeout(self.read_timeout, page.url()).await {
            Ok(Ok(url)) => url,
            _ => "unknown".into(),
        };
        debug!("Extracting elements from: {}", url);

        let mut frames = vec![FrameRef::Main];
        match timeout(self.read_timeout, page.frame_count()).await {
            Ok(Ok(count)) => frames.extend((0..count).map(FrameRef::Child)),
            Ok(Err(e)) => warn!("Could not list frames of {}: {:#}", url, e),
            Err(_) => warn!("Listing frames of {} timed out", url),
        }

        let mut elements = Vec::new();
        let mut seen = HashSet::new();
        for frame in frames {
            let tagged = match timeout(self.read_timeout, self.observe_frame(page, frame)).await {
                Ok(Ok(tagged)) => tagged,
                Ok(Err(e)) => {
                    debug!("Frame {:?} of {} skipped: {:#}", frame, url, e);
                    continue;
                }
                Err(_) => {
                    warn!(
                        "Frame {:?} of {} did not answer within {:?}, skipped",
                        frame, url, self.read_timeout
                    );
                    continue;
                }
            };
            for (raw, stable_id) in tagged {
                if !seen.insert(stable_id.clone()) {
                    warn!("Duplicate identifier {} in {:?}, skipping", stable_id, frame);
                    continue;
                }
                elements.push(ClickableElement {
                    index: elements.len(),
                    tag: raw.tag,
                    text: raw.text,
                    href: raw.href,
                    stable_id,
                    frame: frame.kind(),
                });
            }
        }

        debug!("Found {} elements on {}", elements.len(), url);
        PageContext { url, elements }
    }

    async fn observe_frame(
        &self,
        page: &dyn PageDriver,
        frame: FrameRef,
    ) -> Result<Vec<(RawElement, StableId)>> {
        let proposal = self.propose_namespace(frame.kind());
        let namespace = page.claim_namespace(frame, &proposal).await?;

        let scanned = page.scan_interactive(frame).await?;
        let assignments = allocate_ids(&namespace, &scanned);
        if !assignments.is_empty() {
            page.assign_ids(frame, &assignments).await?;
        }

        let tagged = page
            .scan_interactive(frame)
            .await?
            .into_iter()
            .filter_map(|raw| {
                let id = raw.stable_id.as_deref().and_then(StableId::parse)?;
                Some((raw, id))
            })
            .collect();
        Ok(tagged)
    }

    fn propose_namespace(&self, kind: FrameKind) -> String {
        let n = self.next_namespace.fetch_add(1, Ordering::Relaxed);
        format!("{}{}", kind.namespace_prefix(), n)
    }
}

/// Picks identifiers for the untagged nodes of one document.
///
/// Numbering continues after the highest number already used in `namespace`,
/// so re-running on a partially tagged document never reuses an identifier.
pub fn allocate_ids(namespace: &str, scanned: &[RawElement]) -> Vec<(usize, String)> {
    let mut next = scanned
        .iter()
        .filter_map(|raw| raw.stable_id.as_deref().and_then(StableId::parse))
        .filter_map(|id| match id.parts() {
            Some((ns, n)) if ns == namespace => Some(n + 1),
            _ => None,
        })
        .max()
        .unwrap_or(0);

    scanned
        .iter()
        .enumerate()
        .filter(|(_, raw)| raw.stable_id.is_none())
        .map(|(position, _)| {
            let id = StableId::new(namespace, next);
            next += 1;
            (position, id.as_str().to_string())
        })
        .collect()
}

/// Waits until the page reports its content loaded or its network goes quiet,
/// whichever comes first. Gives up silently after `limit`, even when a single
/// load-state query hangs; returns whether it settled.
pub async fn settle(page: &dyn PageDriver, limit: Duration, poll: Duration) -> bool {
    let wait = async {
        let mut last_count = None;
        loop {
            match page.load_signals().await {
                Ok(signals) if signals.content_ready => return true,
                Ok(signals) => {
                    if last_count == Some(signals.resource_count) {
                        return true;
                    }
                    last_count = Some(signals.resource_count);
                }
                Err(e) => debug!("Load state unavailable: {:#}", e),
            }
            sleep(poll).await;
        }
    };

    match timeout(limit, wait).await {
        Ok(settled) => settled,
        Err(_) => {
            debug!("Page did not settle within {:?}, proceeding", limit);
            false
        }
    }
}
