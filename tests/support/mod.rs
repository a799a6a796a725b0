//! In-memory browser and scripted oracle for driving the loop without Chrome.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use agentic_rpa::brain::{Decision, DecisionRequest, PolicyOracle};
use agentic_rpa::browser::{BrowserContext, FrameRef, LoadSignals, PageDriver, RawElement};
use agentic_rpa::config::{AgentConfig, Timings};
use agentic_rpa::types::{ActionCandidate, ActionKind, SelectorFeedback, StableId, SubTask};
use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;

#[derive(Debug, Clone, Default)]
pub struct FakeNode {
    pub tag: String,
    pub text: String,
    pub href: String,
    pub target: Option<String>,
    pub hidden: bool,
    pub stable_id: Option<String>,
    pub value: String,
    pub options: Vec<String>,
    /// URL of the page a click on this node opens in a new tab.
    pub opens: Option<String>,
    pub click_fails: bool,
    /// Clicks and fills on this node never return.
    pub hangs: bool,
}

impl FakeNode {
    pub fn button(text: &str) -> Self {
        Self {
            tag: "BUTTON".into(),
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn link(text: &str, href: &str) -> Self {
        Self {
            tag: "A".into(),
            text: text.into(),
            href: href.into(),
            ..Default::default()
        }
    }

    pub fn input(placeholder: &str) -> Self {
        Self {
            tag: "INPUT".into(),
            text: placeholder.into(),
            ..Default::default()
        }
    }

    pub fn select(options: &[&str]) -> Self {
        Self {
            tag: "SELECT".into(),
            options: options.iter().map(|o| o.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn tagged(mut self, id: &str) -> Self {
        self.stable_id = Some(id.into());
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn new_tab(mut self, url: &str) -> Self {
        self.target = Some("_blank".into());
        self.opens = Some(url.into());
        self
    }

    pub fn opens_by_script(mut self, url: &str) -> Self {
        self.opens = Some(url.into());
        self
    }

    pub fn failing(mut self) -> Self {
        self.click_fails = true;
        self
    }

    pub fn hanging(mut self) -> Self {
        self.hangs = true;
        self
    }
}

/// How a page answers load-state queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoadState {
    #[default]
    Ready,
    /// Never reports ready and keeps fetching resources.
    Loading,
    Failing,
    Hung,
}

async fn hang<T>() -> Result<T> {
    tokio::time::sleep(Duration::from_secs(3600)).await;
    bail!("hung call returned")
}

#[derive(Debug, Clone, Default)]
pub struct FakeFrame {
    pub nodes: Vec<FakeNode>,
    pub namespace: Option<String>,
    pub inaccessible: bool,
    pub hung: bool,
}

type Registry = Mutex<Vec<Arc<FakePage>>>;
type Sites = Mutex<HashMap<String, Vec<FakeNode>>>;

static NEXT_PAGE: AtomicUsize = AtomicUsize::new(0);

pub struct FakePage {
    id: String,
    url: String,
    /// Index 0 is the main document.
    frames: Mutex<Vec<FakeFrame>>,
    calls: Mutex<Vec<String>>,
    load_state: Mutex<LoadState>,
    load_polls: AtomicUsize,
    registry: Weak<Registry>,
    sites: Weak<Sites>,
}

impl FakePage {
    pub fn add_frame(&self, nodes: Vec<FakeNode>) {
        self.frames.lock().unwrap().push(FakeFrame {
            nodes,
            ..Default::default()
        });
    }

    pub fn add_inaccessible_frame(&self) {
        self.frames.lock().unwrap().push(FakeFrame {
            inaccessible: true,
            ..Default::default()
        });
    }

    /// A frame whose document never answers.
    pub fn add_hung_frame(&self, nodes: Vec<FakeNode>) {
        self.frames.lock().unwrap().push(FakeFrame {
            nodes,
            hung: true,
            ..Default::default()
        });
    }

    pub fn set_load_state(&self, state: LoadState) {
        *self.load_state.lock().unwrap() = state;
    }

    pub fn load_polls(&self) -> usize {
        self.load_polls.load(Ordering::Relaxed)
    }

    fn frame_hangs(&self, frame: FrameRef) -> bool {
        let index = match frame {
            FrameRef::Main => 0,
            FrameRef::Child(i) => i + 1,
        };
        self.frames
            .lock()
            .unwrap()
            .get(index)
            .is_some_and(|f| f.hung)
    }

    pub fn push_node(&self, frame: usize, node: FakeNode) {
        self.frames.lock().unwrap()[frame].nodes.push(node);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn node_value(&self, frame: usize, position: usize) -> String {
        self.frames.lock().unwrap()[frame].nodes[position].value.clone()
    }

    pub fn node_id(&self, frame: usize, position: usize) -> Option<String> {
        self.frames.lock().unwrap()[frame].nodes[position]
            .stable_id
            .clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn frame_index(frames: &[FakeFrame], frame: FrameRef) -> Result<usize> {
        let index = match frame {
            FrameRef::Main => 0,
            FrameRef::Child(i) => i + 1,
        };
        match frames.get(index) {
            Some(f) if !f.inaccessible => Ok(index),
            Some(_) => bail!("frame {:?} is not accessible", frame),
            None => bail!("frame {:?} does not exist", frame),
        }
    }

    fn matches(node: &FakeNode, selector: &str) -> bool {
        match StableId::parse(selector) {
            Some(id) if selector.trim_start().starts_with('[') => {
                node.stable_id.as_deref() == Some(id.as_str())
            }
            _ => node.tag.eq_ignore_ascii_case(selector.trim()),
        }
    }

    fn with_node<T>(
        &self,
        frame: FrameRef,
        selector: &str,
        f: impl FnOnce(&mut FakeNode) -> Result<T>,
    ) -> Result<T> {
        let mut frames = self.frames.lock().unwrap();
        let index = Self::frame_index(&frames, frame)?;
        let node = frames[index]
            .nodes
            .iter_mut()
            .find(|n| Self::matches(n, selector))
            .ok_or_else(|| anyhow!("no element matches {}", selector))?;
        f(node)
    }
}

#[async_trait]
impl PageDriver for FakePage {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn url(&self) -> Result<String> {
        Ok(self.url.clone())
    }

    async fn load_signals(&self) -> Result<LoadSignals> {
        let polls = self.load_polls.fetch_add(1, Ordering::Relaxed) as u64;
        let state = *self.load_state.lock().unwrap();
        match state {
            LoadState::Ready => Ok(LoadSignals {
                content_ready: true,
                resource_count: 0,
            }),
            LoadState::Loading => Ok(LoadSignals {
                content_ready: false,
                resource_count: polls,
            }),
            LoadState::Failing => bail!("execution context was destroyed"),
            LoadState::Hung => hang().await,
        }
    }

    async fn frame_count(&self) -> Result<usize> {
        Ok(self.frames.lock().unwrap().len() - 1)
    }

    async fn claim_namespace(&self, frame: FrameRef, proposal: &str) -> Result<String> {
        if self.frame_hangs(frame) {
            return hang().await;
        }
        let mut frames = self.frames.lock().unwrap();
        let index = Self::frame_index(&frames, frame)?;
        Ok(frames[index]
            .namespace
            .get_or_insert_with(|| proposal.to_string())
            .clone())
    }

    async fn scan_interactive(&self, frame: FrameRef) -> Result<Vec<RawElement>> {
        let frames = self.frames.lock().unwrap();
        let index = Self::frame_index(&frames, frame)?;
        Ok(frames[index]
            .nodes
            .iter()
            .filter(|n| !n.hidden)
            .map(|n| RawElement {
                tag: n.tag.clone(),
                text: n.text.clone(),
                href: n.href.clone(),
                stable_id: n.stable_id.clone(),
            })
            .collect())
    }

    async fn assign_ids(&self, frame: FrameRef, assignments: &[(usize, String)]) -> Result<()> {
        let mut frames = self.frames.lock().unwrap();
        let index = Self::frame_index(&frames, frame)?;
        let mut visible: Vec<&mut FakeNode> =
            frames[index].nodes.iter_mut().filter(|n| !n.hidden).collect();
        for (position, id) in assignments {
            if let Some(node) = visible.get_mut(*position) {
                if node.stable_id.is_none() {
                    node.stable_id = Some(id.clone());
                }
            }
        }
        Ok(())
    }

    async fn count_matches(&self, frame: FrameRef, selector: &str) -> Result<usize> {
        if self.frame_hangs(frame) {
            return hang().await;
        }
        let frames = self.frames.lock().unwrap();
        let index = Self::frame_index(&frames, frame)?;
        Ok(frames[index]
            .nodes
            .iter()
            .filter(|n| Self::matches(n, selector))
            .count())
    }

    async fn link_target(&self, frame: FrameRef, selector: &str) -> Result<Option<String>> {
        self.with_node(frame, selector, |node| {
            Ok(if node.tag == "A" {
                node.target.clone()
            } else {
                None
            })
        })
    }

    async fn click(&self, frame: FrameRef, selector: &str) -> Result<()> {
        self.record(format!("click {selector}"));
        let (hangs, opens) = self.with_node(frame, selector, |node| {
            if node.click_fails {
                bail!("element is not interactable");
            }
            Ok((node.hangs, node.opens.clone()))
        })?;
        if hangs {
            return hang().await;
        }

        if let (Some(url), Some(registry), Some(sites)) =
            (opens, self.registry.upgrade(), self.sites.upgrade())
        {
            let nodes = sites.lock().unwrap().get(&url).cloned().unwrap_or_default();
            let page = new_page(&registry, &sites, &url, nodes);
            registry.lock().unwrap().push(page);
        }
        Ok(())
    }

    async fn focus(&self, frame: FrameRef, selector: &str) -> Result<()> {
        self.record(format!("focus {selector}"));
        self.with_node(frame, selector, |_| Ok(()))
    }

    async fn fill(&self, frame: FrameRef, selector: &str, value: &str) -> Result<()> {
        self.record(format!("fill {selector}"));
        if self.with_node(frame, selector, |node| Ok(node.hangs))? {
            return hang().await;
        }
        self.with_node(frame, selector, |node| {
            node.value = value.to_string();
            Ok(())
        })
    }

    async fn select_option(&self, frame: FrameRef, selector: &str, value: &str) -> Result<()> {
        self.record(format!("select {selector}"));
        self.with_node(frame, selector, |node| {
            if !node.options.iter().any(|o| o == value) {
                bail!("no option matches {}", value);
            }
            node.value = value.to_string();
            Ok(())
        })
    }
}

fn new_page(
    registry: &Arc<Registry>,
    sites: &Arc<Sites>,
    url: &str,
    nodes: Vec<FakeNode>,
) -> Arc<FakePage> {
    Arc::new(FakePage {
        id: format!("page-{}", NEXT_PAGE.fetch_add(1, Ordering::Relaxed)),
        url: url.to_string(),
        frames: Mutex::new(vec![FakeFrame {
            nodes,
            ..Default::default()
        }]),
        calls: Mutex::new(Vec::new()),
        load_state: Mutex::new(LoadState::Ready),
        load_polls: AtomicUsize::new(0),
        registry: Arc::downgrade(registry),
        sites: Arc::downgrade(sites),
    })
}

#[derive(Default)]
pub struct FakeBrowser {
    registry: Arc<Registry>,
    sites: Arc<Sites>,
    unreachable: bool,
}

impl FakeBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    /// A browser whose navigations all fail.
    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Self::default()
        }
    }

    /// Content served when `url` is opened, either by `open` or by a click.
    pub fn site(&self, url: &str, nodes: Vec<FakeNode>) {
        self.sites.lock().unwrap().insert(url.to_string(), nodes);
    }

    pub fn add_page(&self, url: &str, nodes: Vec<FakeNode>) -> Arc<FakePage> {
        let page = new_page(&self.registry, &self.sites, url, nodes);
        self.registry.lock().unwrap().push(page.clone());
        page
    }

    pub fn fake_pages(&self) -> Vec<Arc<FakePage>> {
        self.registry.lock().unwrap().clone()
    }
}

#[async_trait]
impl BrowserContext for FakeBrowser {
    async fn pages(&self) -> Result<Vec<Arc<dyn PageDriver>>> {
        Ok(self
            .registry
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.clone() as Arc<dyn PageDriver>)
            .collect())
    }

    async fn open(&self, url: &str) -> Result<Arc<dyn PageDriver>> {
        if self.unreachable {
            bail!("net::ERR_NAME_NOT_RESOLVED");
        }
        let nodes = self
            .sites
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or_default();
        Ok(self.add_page(url, nodes))
    }
}

pub enum Reply {
    Decide(Decision),
    Fail(&'static str),
    Hang,
}

/// What the oracle was shown on one call.
#[derive(Debug, Clone)]
pub struct Seen {
    pub goal: String,
    pub goal_index: usize,
    pub goal_count: usize,
    pub next_goal: Option<String>,
    pub url: String,
    pub element_ids: Vec<String>,
    pub history_len: usize,
    pub feedback: Option<SelectorFeedback>,
}

/// Plays back canned replies in order and repeats the last one forever.
pub struct ScriptedOracle {
    replies: Mutex<VecDeque<Reply>>,
    seen: Mutex<Vec<Seen>>,
}

impl ScriptedOracle {
    pub fn new(replies: Vec<Reply>) -> Arc<Self> {
        assert!(!replies.is_empty());
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl PolicyOracle for ScriptedOracle {
    async fn decide(&self, request: &DecisionRequest<'_>) -> Result<Decision> {
        self.seen.lock().unwrap().push(Seen {
            goal: request.goal.to_string(),
            goal_index: request.goal_index,
            goal_count: request.goal_count,
            next_goal: request.next_goal.map(String::from),
            url: request.page.url.clone(),
            element_ids: request
                .page
                .elements
                .iter()
                .map(|e| e.stable_id.to_string())
                .collect(),
            history_len: request.history.len(),
            feedback: request.feedback.cloned(),
        });

        let reply = {
            let mut replies = self.replies.lock().unwrap();
            if replies.len() > 1 {
                replies.pop_front()
            } else {
                None
            }
        };
        let reply = match reply {
            Some(reply) => reply,
            None => match self.replies.lock().unwrap().front() {
                Some(Reply::Decide(d)) => Reply::Decide(d.clone()),
                Some(Reply::Fail(m)) => Reply::Fail(*m),
                Some(Reply::Hang) | None => Reply::Hang,
            },
        };

        match reply {
            Reply::Decide(decision) => Ok(decision),
            Reply::Fail(message) => Err(anyhow!(message)),
            Reply::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(anyhow!("unreachable"))
            }
        }
    }
}

fn decision(subtask: &str, action: ActionCandidate) -> Reply {
    Reply::Decide(Decision {
        subtask: SubTask::new(subtask),
        action,
    })
}

pub fn click(selector: &str) -> Reply {
    let mut action = ActionCandidate::new(ActionKind::Click, selector);
    action.explanation = format!("click {selector}");
    action.purpose = "progress the goal".into();
    decision(&format!("Click {selector}"), action)
}

pub fn fill(selector: &str, value: &str) -> Reply {
    let action = ActionCandidate::new(ActionKind::Fill, selector).with_value(value);
    decision(&format!("Fill {selector}"), action)
}

pub fn wait() -> Reply {
    decision("Let the page settle", ActionCandidate::new(ActionKind::Wait, ""))
}

pub fn complete() -> Reply {
    let mut action = ActionCandidate::new(ActionKind::Wait, "");
    action.is_goal_complete = true;
    decision("Goal reached", action)
}

pub fn advance(reason: &str) -> Reply {
    let mut action = ActionCandidate::new(ActionKind::Wait, "");
    action.advance_to_next_goal = true;
    action.advance_reason = Some(reason.into());
    decision("Move on", action)
}

pub fn test_config(budget: usize) -> AgentConfig {
    let mut config = AgentConfig::default();
    config.action_budget = budget;
    config.timings = Timings::instant();
    config.oracle.timeout = Duration::from_millis(200);
    config
}
