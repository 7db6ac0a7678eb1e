use std::{collections::HashMap, path::PathBuf, time::Duration};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{debug, instrument};

use super::{
    clip_detail, InvocationOutcome, InvocationStatus, InvocationTimer, RawFinding, ToolAdapter,
};
use crate::config::{ToolConfig, ToolKind};
use crate::resolver::ScanTarget;

const MAX_EXCERPT_CHARS: usize = 12_000;
const TRUNCATION_MARKER: &str = "\n[... EXCERPT TRUNCATED ...]\n";

/// Environment-driven configuration for the network-backed LLM reviewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmSettings {
    pub api_key: String,
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub timeout_secs: Option<u64>,
}

impl LlmSettings {
    const API_KEY_ENV: &'static str = "MERGEGATE_API_KEY";
    const ENDPOINT_ENV: &'static str = "MERGEGATE_ENDPOINT";
    const MODEL_ENV: &'static str = "MERGEGATE_MODEL";
    const TIMEOUT_ENV: &'static str = "MERGEGATE_TIMEOUT_SECS";

    /// Load settings from environment variables.
    ///
    /// * `MERGEGATE_API_KEY`: API token (required, treated as opaque).
    /// * `MERGEGATE_ENDPOINT`: optional custom base URL.
    /// * `MERGEGATE_MODEL`: optional model override.
    pub fn from_env() -> Result<Self> {
        Self::from_map(std::env::vars().collect())
    }

    fn from_map(vars: HashMap<String, String>) -> Result<Self> {
        let api_key = vars
            .get(Self::API_KEY_ENV)
            .cloned()
            .filter(|v| !v.trim().is_empty())
            .with_context(|| {
                format!(
                    "environment variable {} must be set when the llm tool is enabled",
                    Self::API_KEY_ENV
                )
            })?;
        let endpoint = vars
            .get(Self::ENDPOINT_ENV)
            .cloned()
            .filter(|v| !v.trim().is_empty());
        let model = vars
            .get(Self::MODEL_ENV)
            .cloned()
            .filter(|v| !v.trim().is_empty());
        let timeout_secs = vars
            .get(Self::TIMEOUT_ENV)
            .and_then(|v| v.trim().parse::<u64>().ok());
        Ok(Self {
            api_key,
            endpoint,
            model,
            timeout_secs,
        })
    }
}

/// Network-backed reviewer posting file excerpts to a messages-style API.
///
/// The adapter performs a single attempt; transient HTTP classes surface as
/// `TransientFailure` so the scheduler owns the bounded retry policy.
#[derive(Debug, Clone)]
pub struct LlmReviewAdapter {
    http: Client,
    url: String,
    api_key: String,
    model: String,
}

impl LlmReviewAdapter {
    pub fn new(settings: &LlmSettings) -> Result<Self> {
        if settings.api_key.trim().is_empty() {
            bail!("LLM API key must be provided via MERGEGATE_API_KEY");
        }
        let base = settings
            .endpoint
            .clone()
            .unwrap_or_else(|| "https://api.anthropic.com".to_string());
        let url = format!("{}/v1/messages", base.trim_end_matches('/'));
        let http = Client::builder()
            .user_agent("mergegate/0.3")
            .timeout(Duration::from_secs(settings.timeout_secs.unwrap_or(60)))
            .build()
            .context("failed to build LLM HTTP client")?;
        Ok(Self {
            http,
            url,
            api_key: settings.api_key.clone(),
            model: settings
                .model
                .clone()
                .unwrap_or_else(|| "claude-3-5-sonnet-latest".to_string()),
        })
    }

    fn system_prompt(config: &ToolConfig) -> String {
        let mut prompt = SYSTEM_PROMPT.to_string();
        if let Some(extra) = config
            .extra_instructions
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            prompt.push_str("\n\n");
            prompt.push_str(extra);
        }
        prompt
    }

    /// Build the user message: patch text from the change-set descriptor when
    /// present, otherwise the file content, clipped to the excerpt budget.
    fn user_message(target: &ScanTarget, excerpt: &str) -> String {
        let kind = if target.patch.is_some() {
            "Patch"
        } else {
            "File"
        };
        format!(
            "{kind} under review: {}\n\n{}",
            target.path.display(),
            truncate_excerpt(excerpt, MAX_EXCERPT_CHARS)
        )
    }

    async fn call_api(&self, payload: &MessagesRequest) -> ApiReply {
        let response = match self
            .http
            .post(&self.url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(payload)
            .send()
            .await
        {
            Ok(response) => response,
            // Connect errors and client-side timeouts are transient classes.
            Err(err) => {
                return ApiReply::Failed(
                    InvocationStatus::TransientFailure,
                    clip_detail(&err.to_string()),
                )
            }
        };

        let status = response.status();
        if !status.is_success() {
            let transient = status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
            let body = response.text().await.unwrap_or_default();
            let invocation_status = if transient {
                InvocationStatus::TransientFailure
            } else {
                InvocationStatus::ProcessFailure
            };
            return ApiReply::Failed(
                invocation_status,
                clip_detail(&format!("reviewer API error ({status}): {body}")),
            );
        }

        let message: MessagesResponse = match response.json().await {
            Ok(message) => message,
            Err(err) => {
                return ApiReply::Failed(
                    InvocationStatus::Unparseable,
                    clip_detail(&err.to_string()),
                )
            }
        };

        ApiReply::Text(
            message
                .content
                .into_iter()
                .find_map(|part| part.text)
                .unwrap_or_default(),
        )
    }

    /// Parse the strict-JSON findings array the reviewer is instructed to emit.
    pub fn parse_verdict(target: &ScanTarget, content: &str) -> Result<Vec<RawFinding>, String> {
        let parsed: Vec<ModelFinding> = serde_json::from_str(content.trim())
            .map_err(|err| format!("reviewer did not return a JSON findings array: {err}"))?;
        Ok(parsed
            .into_iter()
            .map(|item| RawFinding {
                rule_id: item.rule_id.unwrap_or_else(|| "llm.review".into()),
                severity: item.severity,
                path: item
                    .file
                    .map(PathBuf::from)
                    .unwrap_or_else(|| target.path.clone()),
                start_line: item.start_line.unwrap_or(0),
                end_line: item.end_line.unwrap_or(0),
                message: item.message,
                remediation: item.remediation,
            })
            .collect())
    }
}

#[async_trait]
impl ToolAdapter for LlmReviewAdapter {
    fn tool(&self) -> ToolKind {
        ToolKind::Llm
    }

    #[instrument(name = "llm_invoke", skip(self, config), fields(path = %target.path.display()))]
    async fn invoke(&self, target: &ScanTarget, config: &ToolConfig) -> Result<InvocationOutcome> {
        let timer = InvocationTimer::start(self.tool(), target);

        let excerpt = match &target.patch {
            Some(patch) => patch.clone(),
            None => match tokio::fs::read_to_string(&target.path).await {
                Ok(content) => content,
                Err(err) => {
                    return Ok(timer.finish(
                        InvocationStatus::ProcessFailure,
                        clip_detail(&format!("failed to read target: {err}")),
                        Vec::new(),
                    ))
                }
            },
        };

        let payload = MessagesRequest {
            model: self.model.clone(),
            system: Self::system_prompt(config),
            messages: vec![Message {
                role: "user".into(),
                content: Self::user_message(target, &excerpt),
            }],
            max_tokens: 1500,
        };

        // The per-tool timeout is the invocation deadline; an over-deadline
        // review is a Timeout, not a retryable transient failure.
        let reply = match timeout(config.timeout(), self.call_api(&payload)).await {
            Ok(reply) => reply,
            Err(_elapsed) => {
                return Ok(timer.finish(
                    InvocationStatus::Timeout,
                    clip_detail(&format!("exceeded {}s", config.timeout_secs)),
                    Vec::new(),
                ))
            }
        };

        let text = match reply {
            ApiReply::Text(text) => text,
            ApiReply::Failed(status, detail) => {
                return Ok(timer.finish(status, detail, Vec::new()))
            }
        };

        match Self::parse_verdict(target, &text) {
            Ok(findings) => {
                debug!(count = findings.len(), "llm review finished");
                Ok(timer.finish(InvocationStatus::Completed, None, findings))
            }
            // Content-based failure; never retried.
            Err(detail) => Ok(timer.finish(
                InvocationStatus::Unparseable,
                clip_detail(&detail),
                Vec::new(),
            )),
        }
    }
}

/// Outcome of one reviewer API exchange, before the verdict is parsed.
enum ApiReply {
    Text(String),
    Failed(InvocationStatus, Option<String>),
}

const SYSTEM_PROMPT: &str = "You are a security reviewer. Analyze the provided source file and respond with a strict JSON array of findings, possibly empty: [{\"severity\": \"info|low|medium|high|critical\", \"rule_id\": \"...\", \"file\": \"...\", \"start_line\": 1, \"end_line\": 1, \"message\": \"...\", \"remediation\": \"...\"}]. Respond with JSON only, no prose.";

/// Clip a file excerpt to a character budget, marking the cut.
fn truncate_excerpt(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    let mut clipped: String = input.chars().take(max_chars).collect();
    clipped.push_str(TRUNCATION_MARKER);
    clipped
}

#[derive(Serialize)]
struct MessagesRequest {
    model: String,
    system: String,
    messages: Vec<Message>,
    max_tokens: u32,
}

#[derive(Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    _type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct ModelFinding {
    severity: String,
    #[serde(default)]
    rule_id: Option<String>,
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    start_line: Option<u32>,
    #[serde(default)]
    end_line: Option<u32>,
    message: String,
    #[serde(default)]
    remediation: Option<String>,
}
