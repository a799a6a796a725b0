//! Goal-driven browser agent: observe the page, ask a policy for the next
//! action, resolve and execute it, record the outcome, repeat per goal.

pub mod brain;
pub mod browser;
pub mod config;
pub mod dom;
pub mod error;
pub mod executor;
pub mod face;
pub mod hands;
pub mod orchestrator;
pub mod selector;
pub mod session;
pub mod types;

pub use brain::{Decision, DecisionRequest, OpenAiOracle, PolicyOracle};
pub use config::AgentConfig;
pub use error::{AgentError, AgentResult};
pub use orchestrator::Orchestrator;
pub use session::{SessionReport, run_goals, run_session};
pub use types::{
    ActionCandidate, ActionHistoryEntry, ActionKind, ClickableElement, PageContext, Profile,
    SelectorFeedback, Step, SubTask, Verdict,
};
