//! The browser capability the action loop consumes.
//!
//! Pages are addressed through `PageDriver` handles that are re-listed from the
//! `BrowserContext` every cycle. Frames are addressed by position in the page's
//! current sub-frame list, so a `FrameRef` is only meaningful until the next
//! suspension point.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::FrameKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameRef {
    Main,
    /// Index into the page's flattened sub-frame list.
    Child(usize),
}

impl FrameRef {
    pub fn kind(self) -> FrameKind {
        match self {
            FrameRef::Main => FrameKind::Main,
            FrameRef::Child(_) => FrameKind::Iframe,
        }
    }
}

/// An interactive node as read from one document, in document order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawElement {
    pub tag: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub href: String,
    #[serde(default)]
    pub stable_id: Option<String>,
}

/// Progress indicators sampled while waiting for a page to settle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadSignals {
    /// `DOMContentLoaded` has fired.
    pub content_ready: bool,
    /// Resource entries fetched so far; unchanged between samples means the network is quiet.
    pub resource_count: u64,
}

#[async_trait]
pub trait PageDriver: Send + Sync {
    /// Identifier of the tab, stable for its lifetime.
    fn id(&self) -> String;

    async fn url(&self) -> Result<String>;

    async fn load_signals(&self) -> Result<LoadSignals>;

    /// Number of sub-frames, nested ones included.
    async fn frame_count(&self) -> Result<usize>;

    /// Returns the identifier namespace owned by the frame's document, claiming
    /// `proposal` if the document has none yet.
    async fn claim_namespace(&self, frame: FrameRef, proposal: &str) -> Result<String>;

    /// Visible interactive nodes of the frame's document.
    async fn scan_interactive(&self, frame: FrameRef) -> Result<Vec<RawElement>>;

    /// Writes identifiers onto nodes by their position in `scan_interactive` order.
    /// Nodes that already carry one are left alone.
    async fn assign_ids(&self, frame: FrameRef, assignments: &[(usize, String)]) -> Result<()>;

    async fn count_matches(&self, frame: FrameRef, selector: &str) -> Result<usize>;

    /// The `target` attribute when the node is a link.
    async fn link_target(&self, frame: FrameRef, selector: &str) -> Result<Option<String>>;

    async fn click(&self, frame: FrameRef, selector: &str) -> Result<()>;

    async fn focus(&self, frame: FrameRef, selector: &str) -> Result<()>;

    async fn fill(&self, frame: FrameRef, selector: &str, value: &str) -> Result<()>;

    async fn select_option(&self, frame: FrameRef, selector: &str, value: &str) -> Result<()>;
}

#[async_trait]
pub trait BrowserContext: Send + Sync {
    /// Open pages in creation order. The last one is the active page.
    async fn pages(&self) -> Result<Vec<Arc<dyn PageDriver>>>;

    /// Opens a new page and navigates it to `url`.
    async fn open(&self, url: &str) -> Result<Arc<dyn PageDriver>>;
}

pub async fn page_ids(context: &dyn BrowserContext) -> Result<HashSet<String>> {
    Ok(context.pages().await?.iter().map(|p| p.id()).collect())
}
