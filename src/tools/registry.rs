//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / risk / capabilities / schema / execute），
//! 由 ToolRegistry 按名注册与查找。注册表本身不执行任何调用，执行只能走 choke point。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::{schema_for, JsonSchema};
use serde_json::Value;

use crate::policy::RiskClass;
use crate::tools::sandbox::Capabilities;

/// 工具 trait：执行入参与出参都是结构化 JSON，绝不返回对话文本
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（计划中 "tool" 字段引用的名字）
    fn name(&self) -> &str;

    /// 工具描述（供规划模型理解功能）
    fn description(&self) -> &str;

    /// 自报风险类别；策略配置可按名覆盖
    fn risk(&self) -> RiskClass;

    /// 能力清单；choke point 核对声明与风险是否一致
    fn capabilities(&self) -> Capabilities;

    /// 参数 JSON Schema；choke point 据此做入参校验
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 执行工具；错误用 String 描述，由 choke point 统一分类
    async fn execute(&self, args: Value) -> Result<Value, String>;
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn risk_of(&self, name: &str) -> Option<RiskClass> {
        self.tools.get(name).map(|t| t.risk())
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// 返回 (name, description, risk) 列表，用于 doctor 与规划上下文
    pub fn tool_descriptions(&self) -> Vec<(String, String, RiskClass)> {
        let mut out: Vec<(String, String, RiskClass)> = self
            .tools
            .values()
            .map(|t| (t.name().to_string(), t.description().to_string(), t.risk()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// 工具表的 schema JSON，注入规划上下文，减少模型输出格式错误
    pub fn to_schema_json(&self) -> Value {
        let mut tools: Vec<Value> = self
            .tools
            .values()
            .map(|t| {
                serde_json::json!({
                    "name": t.name(),
                    "description": t.description(),
                    "risk": t.risk(),
                    "parameters": t.parameters_schema(),
                })
            })
            .collect();
        tools.sort_by_key(|v| v["name"].as_str().unwrap_or("").to_string());
        Value::Array(tools)
    }
}

/// 计划提议的顶层 JSON 结构（仅用于 Schema 生成，注入规划 prompt）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ProposalFormat {
    /// 工具调用列表，每项形如 {"tool": "...", "args": {...}}
    pub tool_calls: Vec<ToolCallFormat>,
    /// 代码变更的 unified diff 文本，无变更则省略
    pub diff: Option<String>,
    /// 阶段标签，如 lint_fix
    pub phase: Option<String>,
    /// 后续任务意图
    pub follow_ups: Vec<String>,
}

#[allow(dead_code)]
#[derive(JsonSchema)]
struct ToolCallFormat {
    pub tool: String,
    pub args: std::collections::HashMap<String, String>,
}

/// 计划提议的 JSON Schema 字符串
pub fn proposal_schema_json() -> String {
    let schema = schema_for!(ProposalFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_else(|_| String::new())
}
