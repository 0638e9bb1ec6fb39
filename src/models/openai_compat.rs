//! OpenAI 兼容规划后端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）。
//! 提示词只包含结构化上下文与输出 schema；回复必须是严格 JSON 的计划，
//! 解析失败按 SchemaInvalid 处理，由编排器决定是否重新规划。

use std::sync::atomic::{AtomicU64, Ordering};

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use serde::Deserialize;

use crate::audit::codec::canonical_json_bytes;
use crate::core::error::ControlError;
use crate::core::types::{AgentType, PlanProposal, ToolCall};
use crate::models::backend::{PlanBackend, PlanContext};

/// 模型回复的 JSON 结构（宽松字段，缺省按空处理）
#[derive(Debug, Deserialize)]
struct RawProposal {
    #[serde(default)]
    tool_calls: Vec<RawToolCall>,
    #[serde(default)]
    diff: Option<String>,
    #[serde(default)]
    phase: Option<String>,
    #[serde(default)]
    follow_ups: Vec<String>,
    #[serde(default)]
    note: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawToolCall {
    tool: String,
    #[serde(default)]
    args: serde_json::Value,
}

pub struct OpenAiCompatBackend {
    client: Client<OpenAIConfig>,
    model: String,
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
}

impl OpenAiCompatBackend {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            prompt_tokens: AtomicU64::new(0),
            completion_tokens: AtomicU64::new(0),
        }
    }

    /// 累计 token 使用 (prompt, completion)
    pub fn token_usage(&self) -> (u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
        )
    }

    fn system_prompt(ctx: &PlanContext) -> String {
        format!(
            "You are a planning backend inside an orchestration control plane.\n\
             Respond with ONE JSON object only, no prose, matching:\n\
             {{\"tool_calls\": [{{\"tool\": \"name\", \"args\": {{}}}}], \
             \"diff\": null, \"phase\": \"label\", \"follow_ups\": [], \"note\": null}}\n\
             Code changes must be proposed as a unified diff in the \"diff\" field, never applied directly.\n\
             Available tools:\n{}",
            ctx.tool_schemas
        )
    }
}

/// 从回复文本中截取 JSON 块（容忍 ```json 围栏）
fn extract_json(output: &str) -> Option<&str> {
    let trimmed = output.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    Some(&trimmed[start..=end])
}

#[async_trait]
impl PlanBackend for OpenAiCompatBackend {
    fn kind(&self) -> &str {
        "openai_compat"
    }

    async fn propose(&self, ctx: &PlanContext) -> Result<PlanProposal, ControlError> {
        let user_payload = canonical_json_bytes(ctx)
            .map_err(|e| ControlError::ModelUnavailable(format!("context encode: {e}")))?;
        let user_text = String::from_utf8_lossy(&user_payload).into_owned();

        let messages = vec![
            ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(Self::system_prompt(ctx))
                    .build()
                    .map_err(|e| ControlError::ModelUnavailable(e.to_string()))?,
            ),
            ChatCompletionRequestMessage::User(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(user_text)
                    .build()
                    .map_err(|e| ControlError::ModelUnavailable(e.to_string()))?,
            ),
        ];

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .build()
            .map_err(|e| ControlError::ModelUnavailable(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| ControlError::ModelUnavailable(e.to_string()))?;

        if let Some(usage) = &response.usage {
            self.prompt_tokens
                .fetch_add(usage.prompt_tokens as u64, Ordering::Relaxed);
            self.completion_tokens
                .fetch_add(usage.completion_tokens as u64, Ordering::Relaxed);
        }

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        let json = extract_json(&content)
            .ok_or_else(|| ControlError::SchemaInvalid("plan reply contains no JSON".into()))?;
        let raw: RawProposal = serde_json::from_str(json)
            .map_err(|e| ControlError::SchemaInvalid(format!("plan reply parse: {e}")))?;

        Ok(PlanProposal {
            agent_type: AgentType::Planner,
            tool_calls: raw
                .tool_calls
                .into_iter()
                .map(|c| {
                    let args = if c.args.is_null() {
                        serde_json::json!({})
                    } else {
                        c.args
                    };
                    ToolCall::new(c.tool, args)
                })
                .collect(),
            diff: raw.diff.filter(|d| !d.trim().is_empty()),
            phase: raw.phase,
            follow_ups: raw.follow_ups,
            note: raw.note,
        })
    }
}
