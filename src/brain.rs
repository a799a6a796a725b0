use anyhow::{Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::config::OracleConfig;
use crate::types::{ActionCandidate, ActionHistoryEntry, PageContext, Profile, SelectorFeedback, SubTask};

/// Everything the oracle sees for one decision cycle.
#[derive(Debug, Clone, Copy)]
pub struct DecisionRequest<'a> {
    pub goal: &'a str,
    pub goal_index: usize,
    pub goal_count: usize,
    pub next_goal: Option<&'a str>,
    pub page: &'a PageContext,
    pub history: &'a [ActionHistoryEntry],
    pub profile: &'a Profile,
    pub feedback: Option<&'a SelectorFeedback>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub subtask: SubTask,
    pub action: ActionCandidate,
}

/// The decision-making policy. Implementations need not be deterministic.
#[async_trait]
pub trait PolicyOracle: Send + Sync {
    async fn decide(&self, request: &DecisionRequest<'_>) -> Result<Decision>;
}

const SYSTEM_PROMPT: &str = r#"You are a browser automation agent working through a list of goals on a live website, one action at a time.

Reply with ONE JSON object and nothing else, shaped like:
{"subtask":{"description":"..."},
 "action":{"action":"click|fill|select|wait","selector":"...","value":"...","explanation":"...","purpose":"...",
           "pageUrl":"...","isGoalComplete":false,"advanceToNextGoal":false,"advanceReason":"..."}}

Rules:
1. Don't repeat an action the history shows already succeeded unless necessary.
2. Pick the subtask that best progresses the current goal. The site's flow does not follow the goal list.
3. For the selector use the element's numerical index (e.g. "0", "3") or its dataAiIndex value (e.g. "ai-m0-3").
   Only use selectors present in the element list. Never invent selectors.
4. Only include "value" for fill and select actions.
5. Set isGoalComplete when the current state shows the goal is satisfied.
6. Set advanceToNextGoal when enough has been done to treat the goal as satisfied, and explain why in advanceReason.
7. Use "wait" when the page needs time to settle before anything can be done."#;

/// Oracle backed by an OpenAI-compatible chat completions endpoint.
pub struct OpenAiOracle {
    client: Client,
    api_key: String,
    model: String,
    endpoint: String,
}

impl OpenAiOracle {
    pub fn new(config: &OracleConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| anyhow!("OPENAI_API_KEY not set in environment"))?;
        Ok(Self {
            client: Client::new(),
            api_key,
            model: config.model.clone(),
            endpoint: format!("{}/chat/completions", config.base_url),
        })
    }
}

#[async_trait]
impl PolicyOracle for OpenAiOracle {
    async fn decide(&self, request: &DecisionRequest<'_>) -> Result<Decision> {
        let prompt = build_prompt(request)?;

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&json!({
                "model": self.model,
                "messages": [
                    {"role": "system", "content": SYSTEM_PROMPT},
                    {"role": "user", "content": prompt},
                ],
                "temperature": 0.2,
                "response_format": {"type": "json_object"},
            }))
            .send()
            .await?;

        let status = response.status();
        let json_resp: serde_json::Value = response.json().await?;

        if !status.is_success() {
            let err_msg = json_resp["error"]["message"]
                .as_str()
                .unwrap_or("Unknown API error");
            warn!("Oracle API error ({}): {}", status, err_msg);
            return Err(anyhow!("OpenAI API error ({}): {}", status, err_msg));
        }

        let content = json_resp["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| anyhow!("No content in LLM response: {}", json_resp))?;

        debug!("Oracle says: {}", content);
        parse_decision(content)
    }
}

/// Renders the user message for one cycle.
pub fn build_prompt(request: &DecisionRequest<'_>) -> Result<String> {
    let mut prompt = format!(
        "Current goal: \"{}\" ({} of {})\n",
        request.goal,
        request.goal_index + 1,
        request.goal_count
    );
    match request.next_goal {
        Some(next) => prompt.push_str(&format!("Next goal: \"{next}\"\n")),
        None => prompt.push_str("This is the final goal\n"),
    }

    prompt.push_str(&format!(
        "\nCurrent page and its elements:\n{}\n",
        serde_json::to_string(request.page)?
    ));
    prompt.push_str(&format!(
        "\nPrevious actions taken (ACTION HISTORY):\n{}\n",
        serde_json::to_string(request.history)?
    ));
    prompt.push_str(&format!(
        "\nProfile to use when filling forms (not every field has to exist on the site):\n{}\n",
        serde_json::to_string(request.profile)?
    ));

    if let Some(feedback) = request.feedback {
        prompt.push_str(&format!(
            "\nIMPORTANT: Your previous attempt used selector \"{}\" which does not exist on the page. \
             Choose only from the elements actually present. Available elements: {}\n",
            feedback.invalid_selector,
            feedback.available_elements.join(", ")
        ));
    }

    Ok(prompt)
}

/// Parses the model reply, tolerating markdown fences around the JSON.
pub fn parse_decision(content: &str) -> Result<Decision> {
    let cleaned = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let mut decision: Decision = serde_json::from_str(cleaned)
        .map_err(|e| anyhow!("Failed to parse LLM response: {}", e))?;

    // Outcome fields belong to the loop, not the model.
    decision.subtask.success = Default::default();
    decision.subtask.error = None;
    decision.action.success = false;
    decision.action.error = None;
    Ok(decision)
}
