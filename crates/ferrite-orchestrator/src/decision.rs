use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use ferrite_providers::{ChatMessage, Llm};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplyPart {
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunPart {
    #[serde(rename = "type")]
    pub run_type: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub input: Map<String, Value>,
    #[serde(default)]
    pub max_steps: Option<i64>,
}

impl RunPart {
    pub fn is_code_snippet(&self) -> bool {
        self.run_type.trim().replace(' ', "_") == "run_code_snippet"
    }
}

/// What the agent wants to happen next with the user's turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Reply { reply: ReplyPart },
    Run { run: RunPart },
    ReplyAndRun { reply: ReplyPart, run: RunPart },
}

impl Decision {
    pub fn reply_content(&self) -> Option<String> {
        match self {
            Decision::Reply { reply } | Decision::ReplyAndRun { reply, .. } => {
                Some(reply.content.trim().to_string())
            }
            Decision::Run { .. } => None,
        }
    }

    pub fn run_part(&self) -> Option<&RunPart> {
        match self {
            Decision::Run { run } | Decision::ReplyAndRun { run, .. } => Some(run),
            Decision::Reply { .. } => None,
        }
    }
}

pub struct DecisionRequest<'a> {
    pub user_message: &'a str,
    pub conversation_id: &'a str,
    pub history_messages: &'a [ChatMessage],
    pub recent_runs: &'a [Value],
    pub previous_observation: Option<&'a Map<String, Value>>,
}

#[async_trait]
pub trait AgentDecider: Send + Sync {
    async fn decide(&self, req: DecisionRequest<'_>) -> anyhow::Result<Decision>;
}

/// Decider backed by the configured LLM. The model answers with one JSON
/// object; anything unparseable falls back to reply-only with the raw text.
pub struct LlmDecider {
    llm: Arc<dyn Llm>,
    allowed_run_types: Vec<String>,
    decision_timeout: Duration,
}

impl LlmDecider {
    pub fn new(llm: Arc<dyn Llm>, allowed_run_types: Vec<String>, decision_timeout: Duration) -> Self {
        Self {
            llm,
            allowed_run_types,
            decision_timeout,
        }
    }

    fn build_prompt(&self, req: &DecisionRequest<'_>) -> String {
        let mut prompt = String::new();
        prompt.push_str(
            "You orchestrate background runs for a chat assistant.\n\
             Answer with exactly one JSON object, no prose. Shapes:\n\
             {\"decision\":\"reply\",\"reply\":{\"content\":\"...\"}}\n\
             {\"decision\":\"run\",\"run\":{\"type\":\"run_code_snippet\",\"title\":\"...\",\"input\":{...},\"max_steps\":3}}\n\
             {\"decision\":\"reply_and_run\",\"reply\":{...},\"run\":{...}}\n",
        );
        prompt.push_str(&format!(
            "Allowed run types: {}\n\n",
            self.allowed_run_types.join(", ")
        ));
        if !req.history_messages.is_empty() {
            prompt.push_str("Conversation so far:\n");
            for message in req.history_messages {
                prompt.push_str(&format!("{}: {}\n", message.role, message.content));
            }
            prompt.push('\n');
        }
        if !req.recent_runs.is_empty() {
            prompt.push_str(&format!(
                "Recent runs: {}\n\n",
                serde_json::to_string(req.recent_runs).unwrap_or_default()
            ));
        }
        if let Some(observation) = req.previous_observation {
            prompt.push_str(&format!(
                "Previous step observation: {}\n\n",
                serde_json::to_string(observation).unwrap_or_default()
            ));
        }
        prompt.push_str(&format!("User message: {}\n", req.user_message));
        prompt
    }
}

/// Parse the model's decision JSON, tolerating markdown fences.
pub fn parse_decision(raw: &str) -> Option<Decision> {
    let trimmed = raw.trim();
    let body = if let Some(stripped) = trimmed.strip_prefix("```") {
        let stripped = stripped.strip_prefix("json").unwrap_or(stripped);
        stripped.trim_start_matches('\n').trim_end_matches('`').trim_end()
    } else {
        trimmed
    };
    serde_json::from_str(body).ok()
}

#[async_trait]
impl AgentDecider for LlmDecider {
    async fn decide(&self, req: DecisionRequest<'_>) -> anyhow::Result<Decision> {
        let prompt = self.build_prompt(&req);
        let raw = tokio::time::timeout(self.decision_timeout, self.llm.generate(&prompt))
            .await
            .map_err(|_| anyhow::anyhow!("agent decision timed out"))??;
        match parse_decision(&raw) {
            Some(decision) => {
                if let Some(run) = decision.run_part() {
                    if !self.allowed_run_types.iter().any(|t| t == &run.run_type) {
                        tracing::warn!(run_type = %run.run_type, "decision run type not allowed, replying instead");
                        return Ok(Decision::Reply {
                            reply: ReplyPart {
                                content: decision.reply_content().unwrap_or_default(),
                            },
                        });
                    }
                }
                Ok(decision)
            }
            None => Ok(Decision::Reply {
                reply: ReplyPart {
                    content: raw.trim().to_string(),
                },
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decision_tagged_union_round_trips() {
        let raw = json!({
            "decision": "run",
            "run": {
                "type": "run_code_snippet",
                "title": "calc",
                "input": {"language": "python", "code": "print(1)"},
                "max_steps": 2
            }
        });
        let decision: Decision = serde_json::from_value(raw.clone()).unwrap();
        let run = decision.run_part().unwrap();
        assert!(run.is_code_snippet());
        assert_eq!(run.max_steps, Some(2));
        assert_eq!(serde_json::to_value(&decision).unwrap()["decision"], "run");
    }

    #[test]
    fn parse_tolerates_fenced_json() {
        let fenced = "```json\n{\"decision\":\"reply\",\"reply\":{\"content\":\"hi\"}}\n```";
        let decision = parse_decision(fenced).unwrap();
        assert_eq!(decision.reply_content().as_deref(), Some("hi"));
    }

    #[test]
    fn parse_failure_returns_none() {
        assert!(parse_decision("sure, let me think...").is_none());
    }

    #[test]
    fn run_type_normalization_handles_spaces() {
        let run = RunPart {
            run_type: "run code snippet".to_string(),
            title: None,
            input: Map::new(),
            max_steps: None,
        };
        assert!(run.is_code_snippet());
    }

    #[tokio::test]
    async fn unparseable_llm_output_becomes_reply() {
        let decider = LlmDecider::new(
            Arc::new(ferrite_providers::StubLlm),
            vec!["run_code_snippet".to_string()],
            Duration::from_secs(5),
        );
        let decision = decider
            .decide(DecisionRequest {
                user_message: "hello",
                conversation_id: "c1",
                history_messages: &[],
                recent_runs: &[],
                previous_observation: None,
            })
            .await
            .unwrap();
        assert!(decision.reply_content().is_some());
    }
}
