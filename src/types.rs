use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Decision cycles allowed per goal before it is marked exhausted.
pub const DEFAULT_ACTION_BUDGET: usize = 15;

/// Attribute the observer writes onto interactive nodes.
pub const STABLE_ID_ATTRIBUTE: &str = "data-ai-index";

pub const EXCEEDED_ATTEMPTS_ERROR: &str = "Failed to complete goal within maximum attempts";

pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);
pub const NEW_TAB_TIMEOUT: Duration = Duration::from_secs(10);
pub const SCRIPT_TAB_WINDOW: Duration = Duration::from_secs(5);
pub const NEW_PAGE_LOAD_TIMEOUT: Duration = Duration::from_secs(8);
pub const WAIT_ACTION_DELAY: Duration = Duration::from_millis(1500);
pub const INTER_ACTION_DELAY: Duration = Duration::from_millis(800);
pub const ERROR_BACKOFF: Duration = Duration::from_millis(1000);
pub const POST_NAVIGATION_PAUSE: Duration = Duration::from_millis(1000);
pub const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(30);
/// Bound on any single page call: a read, a click, a fill.
pub const ACTION_TIMEOUT: Duration = Duration::from_secs(15);

/// Key/value description of the person the agent impersonates when filling forms.
pub type Profile = BTreeMap<String, serde_json::Value>;

pub fn default_profile() -> Profile {
    [
        ("name", "John Doe"),
        ("email", "john.doe@example.com"),
        ("phone", "+1234567890"),
        ("company", "Example Inc."),
        ("jobTitle", "Software Engineer"),
        ("country", "United States"),
        ("timezone", "America/New_York"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
    .collect()
}

pub fn default_goals() -> Vec<String> {
    [
        "Detect \"Book a Demo\" (or similar) buttons/links",
        "Click through to the booking flow",
        "Fill out any required forms",
        "Complete the meeting scheduling process",
        "Verify the booking was successful (e.g., confirmation page)",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// Tri-state outcome shared by steps and subtasks. Serialised the way the UI reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Verdict {
    #[serde(rename = "true")]
    Passed,
    #[serde(rename = "false")]
    Failed,
    #[default]
    #[serde(rename = "not attempted")]
    NotAttempted,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubTask {
    pub description: String,
    #[serde(default)]
    pub success: Verdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SubTask {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            success: Verdict::NotAttempted,
            error: None,
        }
    }
}

/// Execution record for one goal.
///
/// Subtasks can only be appended, and completion is set at most once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub description: String,
    pub success: Verdict,
    subtasks: Vec<SubTask>,
    completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Step {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            description: goal.into(),
            success: Verdict::NotAttempted,
            subtasks: Vec::new(),
            completed: false,
            error: None,
        }
    }

    pub fn subtasks(&self) -> &[SubTask] {
        &self.subtasks
    }

    pub fn completed(&self) -> bool {
        self.completed
    }

    /// Appends a subtask and returns its position.
    pub fn push_subtask(&mut self, subtask: SubTask) -> usize {
        self.subtasks.push(subtask);
        self.subtasks.len() - 1
    }

    pub fn subtask_mut(&mut self, position: usize) -> Option<&mut SubTask> {
        self.subtasks.get_mut(position)
    }

    pub fn last_subtask_mut(&mut self) -> Option<&mut SubTask> {
        self.subtasks.last_mut()
    }

    /// Marks the goal satisfied and drops any step-level fault from an earlier
    /// cycle. Returns false if it was already completed.
    pub fn mark_completed(&mut self) -> bool {
        if self.completed {
            return false;
        }
        self.completed = true;
        self.success = Verdict::Passed;
        self.error = None;
        if let Some(last) = self.subtasks.last_mut() {
            last.success = Verdict::Passed;
        }
        true
    }

    pub fn mark_exhausted(&mut self) {
        self.success = Verdict::Failed;
        self.error = Some(EXCEEDED_ATTEMPTS_ERROR.to_string());
    }

    /// Attributes a cycle fault to the newest subtask, or to the step when there is none.
    pub fn record_fault(&mut self, message: impl Into<String>) {
        let message = message.into();
        match self.subtasks.last_mut() {
            Some(subtask) => {
                subtask.success = Verdict::Failed;
                subtask.error = Some(message);
            }
            None => {
                self.error = Some(message);
            }
        }
    }
}

/// Which document of a page an element lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    Main,
    Iframe,
}

impl FrameKind {
    /// Namespace prefix used in stable identifiers for documents of this kind.
    pub fn namespace_prefix(self) -> char {
        match self {
            FrameKind::Main => 'm',
            FrameKind::Iframe => 'f',
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameKind::Main => f.write_str("main"),
            FrameKind::Iframe => f.write_str("iframe"),
        }
    }
}

/// Opaque handle written onto a DOM node, of the form `ai-<namespace>-<n>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StableId(String);

impl StableId {
    pub const PREFIX: &'static str = "ai-";

    pub fn new(namespace: &str, sequence: u64) -> Self {
        Self(format!("{}{namespace}-{sequence}", Self::PREFIX))
    }

    /// Accepts the bare identifier (`ai-m0-3`) or its attribute selector form.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let bare = match raw.strip_prefix('[') {
            Some(rest) => {
                let inner = rest.strip_suffix(']')?;
                let (attr, value) = inner.split_once('=')?;
                if attr.trim() != STABLE_ID_ATTRIBUTE {
                    return None;
                }
                value.trim().trim_matches(|c| c == '"' || c == '\'')
            }
            None => raw,
        };
        let rest = bare.strip_prefix(Self::PREFIX)?;
        if rest.is_empty() || !rest.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return None;
        }
        Some(Self(bare.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The CSS attribute selector addressing this node.
    pub fn selector(&self) -> String {
        format!("[{STABLE_ID_ATTRIBUTE}=\"{}\"]", self.0)
    }

    /// Whether the identifier was handed out inside an iframe document.
    pub fn is_iframe(&self) -> bool {
        self.0
            .strip_prefix(Self::PREFIX)
            .is_some_and(|rest| rest.starts_with(FrameKind::Iframe.namespace_prefix()))
    }

    /// Namespace and sequence number, e.g. `("m0", 3)` for `ai-m0-3`.
    pub fn parts(&self) -> Option<(&str, u64)> {
        let rest = self.0.strip_prefix(Self::PREFIX)?;
        let (namespace, sequence) = rest.rsplit_once('-')?;
        Some((namespace, sequence.parse().ok()?))
    }
}

impl fmt::Display for StableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClickableElement {
    /// Position in the current extraction only.
    pub index: usize,
    pub tag: String,
    pub text: String,
    pub href: String,
    #[serde(rename = "dataAiIndex")]
    pub stable_id: StableId,
    pub frame: FrameKind,
}

impl ClickableElement {
    /// One-line description handed back to the oracle as a remediation hint.
    pub fn describe(&self) -> String {
        let mut text: String = self.text.chars().take(40).collect();
        if self.text.chars().count() > 40 {
            text.push_str("...");
        }
        format!(
            "{} \"{}\" (index {}, {}, {})",
            self.tag.to_lowercase(),
            text,
            self.index,
            self.stable_id,
            self.frame
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageContext {
    pub url: String,
    pub elements: Vec<ClickableElement>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Click,
    Fill,
    Select,
    Wait,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionKind::Click => "click",
            ActionKind::Fill => "fill",
            ActionKind::Select => "select",
            ActionKind::Wait => "wait",
        };
        f.write_str(name)
    }
}

/// One action proposed by the oracle. `success` and `error` are filled in by the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionCandidate {
    pub action: ActionKind,
    #[serde(default)]
    pub selector: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default)]
    pub explanation: String,
    #[serde(default)]
    pub purpose: String,
    #[serde(default)]
    pub is_goal_complete: bool,
    #[serde(default)]
    pub advance_to_next_goal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advance_reason: Option<String>,
    #[serde(default)]
    pub page_url: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionCandidate {
    pub fn new(action: ActionKind, selector: impl Into<String>) -> Self {
        Self {
            action,
            selector: selector.into(),
            value: None,
            explanation: String::new(),
            purpose: String::new(),
            is_goal_complete: false,
            advance_to_next_goal: false,
            advance_reason: None,
            page_url: String::new(),
            success: false,
            error: None,
        }
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// True when the oracle considers the current goal done.
    pub fn signals_completion(&self) -> bool {
        self.is_goal_complete || self.advance_to_next_goal
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub page_url: String,
    pub purpose: String,
    pub explanation: String,
    pub success: bool,
}

impl ActionHistoryEntry {
    pub fn from_action(action: &ActionCandidate) -> Self {
        Self {
            timestamp: Utc::now(),
            page_url: action.page_url.clone(),
            purpose: action.purpose.clone(),
            explanation: action.explanation.clone(),
            success: action.success,
        }
    }
}

/// Remediation data for the next oracle call after a selector failed to resolve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectorFeedback {
    pub invalid_selector: String,
    pub available_elements: Vec<String>,
}
