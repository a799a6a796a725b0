use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

use crate::brain::{Decision, DecisionRequest, PolicyOracle};
use crate::browser::{BrowserContext, PageDriver};
use crate::config::{AgentConfig, Timings};
use crate::dom::PageObserver;
use crate::error::{AgentError, AgentResult};
use crate::executor::ActionExecutor;
use crate::selector::SelectorResolver;
use crate::types::{
    ActionHistoryEntry, ActionKind, Profile, SelectorFeedback, Step, Verdict,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoalState {
    Pending,
    Active,
    Completed,
    Exhausted,
}

/// How one decision cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The oracle reported the goal satisfied; nothing was executed.
    CompletionSignaled,
    /// The selector matched nothing. No history is recorded for it.
    ResolutionFailed,
    Executed { success: bool },
    /// Unclassified error caught at the cycle boundary.
    Faulted,
}

/// Per-goal state plus the decision cycles it has left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GoalMachine {
    pub state: GoalState,
    pub remaining: usize,
}

impl GoalMachine {
    pub fn new(budget: usize) -> Self {
        Self {
            state: GoalState::Pending,
            remaining: budget,
        }
    }

    pub fn start(self) -> Self {
        match self.state {
            GoalState::Pending if self.remaining == 0 => Self {
                state: GoalState::Exhausted,
                ..self
            },
            GoalState::Pending => Self {
                state: GoalState::Active,
                ..self
            },
            _ => self,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == GoalState::Active
    }
}

/// Advances an active goal by one cycle. Every cycle that does not complete the
/// goal spends one unit of budget; terminal and pending states are left untouched.
pub fn transition(machine: GoalMachine, outcome: CycleOutcome) -> GoalMachine {
    if machine.state != GoalState::Active {
        return machine;
    }
    match outcome {
        CycleOutcome::CompletionSignaled => GoalMachine {
            state: GoalState::Completed,
            ..machine
        },
        CycleOutcome::ResolutionFailed | CycleOutcome::Executed { .. } | CycleOutcome::Faulted => {
            let remaining = machine.remaining.saturating_sub(1);
            let state = if remaining == 0 {
                GoalState::Exhausted
            } else {
                GoalState::Active
            };
            GoalMachine { state, remaining }
        }
    }
}

/// Drives the goals of one session through observe, decide, resolve and execute.
pub struct Orchestrator {
    context: Arc<dyn BrowserContext>,
    oracle: Arc<dyn PolicyOracle>,
    observer: Arc<PageObserver>,
    resolver: SelectorResolver,
    executor: ActionExecutor,
    budget: usize,
    timings: Timings,
    oracle_timeout: Duration,
    history: Vec<ActionHistoryEntry>,
    open_pages: HashSet<String>,
    active_page: Option<String>,
}

impl Orchestrator {
    pub fn new(
        context: Arc<dyn BrowserContext>,
        oracle: Arc<dyn PolicyOracle>,
        config: &AgentConfig,
    ) -> Self {
        let observer = Arc::new(PageObserver::new(&config.timings));
        Self {
            context,
            oracle,
            resolver: SelectorResolver::new(observer.clone()),
            observer,
            executor: ActionExecutor::new(config.timings.clone()),
            budget: config.action_budget,
            timings: config.timings.clone(),
            oracle_timeout: config.oracle.timeout,
            history: Vec::new(),
            open_pages: HashSet::new(),
            active_page: None,
        }
    }

    /// Actions executed so far, in execution order.
    pub fn history(&self) -> &[ActionHistoryEntry] {
        &self.history
    }

    pub fn into_history(self) -> Vec<ActionHistoryEntry> {
        self.history
    }

    /// Processes every goal in order. A failed goal never stops the next one.
    pub async fn run(&mut self, goals: &[String], profile: &Profile) -> Vec<Step> {
        let mut steps = Vec::with_capacity(goals.len());
        for index in 0..goals.len() {
            steps.push(self.run_goal(goals, index, profile).await);
        }
        steps
    }

    pub async fn run_goal(&mut self, goals: &[String], index: usize, profile: &Profile) -> Step {
        let goal = &goals[index];
        info!("=== Starting Goal {}: {} ===", index + 1, goal);

        let mut step = Step::new(goal.clone());
        let mut machine = GoalMachine::new(self.budget).start();
        let mut feedback: Option<SelectorFeedback> = None;

        while machine.is_active() {
            let subtasks_before = step.subtasks().len();
            let outcome = match self
                .cycle(&mut step, goals, index, profile, &mut feedback)
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Error processing subtask: {}", e);
                    if step.subtasks().len() > subtasks_before {
                        step.record_fault(e.to_string());
                    } else {
                        step.error = Some(e.to_string());
                    }
                    sleep(self.timings.error_backoff).await;
                    CycleOutcome::Faulted
                }
            };

            if matches!(outcome, CycleOutcome::Executed { .. }) {
                sleep(self.timings.inter_action_delay).await;
            }
            machine = transition(machine, outcome);
        }

        match machine.state {
            GoalState::Completed => {
                step.mark_completed();
                info!("Goal {} completed", index + 1);
            }
            _ => {
                step.mark_exhausted();
                warn!("Goal {} not completed within {} cycles", index + 1, self.budget);
            }
        }
        step
    }

    async fn cycle(
        &mut self,
        step: &mut Step,
        goals: &[String],
        index: usize,
        profile: &Profile,
        feedback: &mut Option<SelectorFeedback>,
    ) -> AgentResult<CycleOutcome> {
        let pages = timeout(self.timings.action_timeout, self.context.pages())
            .await
            .map_err(|_| AgentError::Timeout {
                operation: "page listing",
                after: self.timings.action_timeout,
            })??;
        self.track_pages(&pages);
        let page = pages.last().cloned().ok_or(AgentError::NoActivePage)?;

        let snapshot = self.observer.observe(page.as_ref()).await;
        let pending = feedback.take();
        let request = DecisionRequest {
            goal: &goals[index],
            goal_index: index,
            goal_count: goals.len(),
            next_goal: goals.get(index + 1).map(String::as_str),
            page: &snapshot,
            history: &self.history,
            profile,
            feedback: pending.as_ref(),
        };

        let Decision {
            subtask,
            mut action,
        } = match timeout(self.oracle_timeout, self.oracle.decide(&request)).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(e)) => return Err(AgentError::Oracle(format!("{e:#}"))),
            Err(_) => return Err(AgentError::OracleTimeout(self.oracle_timeout.as_secs())),
        };

        info!("Next action: {} on {:?}", action.action, action.selector);
        info!("Subtask: {}", subtask.description);
        let position = step.push_subtask(subtask);

        if action.signals_completion() {
            match (action.advance_to_next_goal, action.advance_reason.as_deref()) {
                (true, reason) => info!(
                    "Advanced to next goal: {}",
                    reason.unwrap_or("Goal satisfied")
                ),
                (false, _) => info!("Goal marked as complete."),
            }
            return Ok(CycleOutcome::CompletionSignaled);
        }

        if action.page_url.is_empty() {
            action.page_url = snapshot.url.clone();
        }

        let target = if action.action == ActionKind::Wait {
            None
        } else {
            match self.resolver.resolve(page.as_ref(), &action.selector).await {
                Ok(target) => Some(target),
                Err(AgentError::SelectorNotFound { selector, hints }) => {
                    info!("SELECTOR VALIDATION FAILED: {:?} does not exist", selector);
                    if let Some(subtask) = step.subtask_mut(position) {
                        subtask.error =
                            Some(format!("Selector \"{selector}\" does not exist on the page"));
                    }
                    *feedback = Some(SelectorFeedback {
                        invalid_selector: selector,
                        available_elements: hints,
                    });
                    return Ok(CycleOutcome::ResolutionFailed);
                }
                Err(e) => return Err(e),
            }
        };

        let outcome = self
            .executor
            .execute(
                self.context.as_ref(),
                page.as_ref(),
                target.as_ref(),
                &mut action,
            )
            .await;

        self.history.push(ActionHistoryEntry::from_action(&action));
        if let Some(subtask) = step.subtask_mut(position) {
            if outcome.success {
                subtask.success = Verdict::Passed;
            } else {
                subtask.success = Verdict::Failed;
                subtask.error = outcome.error.clone();
            }
        }
        if let Some(new_page) = &outcome.new_page {
            info!("Page {} opened by the action becomes active", new_page.id());
        }

        Ok(CycleOutcome::Executed {
            success: outcome.success,
        })
    }

    /// Logs tabs that appeared or went away since the last cycle.
    fn track_pages(&mut self, pages: &[Arc<dyn PageDriver>]) {
        let current: HashSet<String> = pages.iter().map(|p| p.id()).collect();
        if !self.open_pages.is_empty() {
            for id in current.difference(&self.open_pages) {
                info!("Page opened: {}", id);
            }
            for id in self.open_pages.difference(&current) {
                info!("Page closed: {}", id);
            }
        }
        self.open_pages = current;

        let active = pages.last().map(|p| p.id());
        if active != self.active_page {
            if let Some(id) = &active {
                info!("Active page: {} ({} open)", id, pages.len());
            }
            self.active_page = active;
        }
    }
}
