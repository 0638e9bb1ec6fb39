//! 模型档案与路由表（config/router.toml）
//!
//! [models.<名字>] 定义模型条目（kind: null / openai_compat），
//! [routing] 把 agent 角色映射到模型名。未路由的角色视为 ModelUnavailable。

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::core::error::ControlError;
use crate::core::types::AgentType;

/// 一条模型定义
#[derive(Clone, Debug, Deserialize)]
pub struct ModelSpec {
    pub kind: String,
    /// openai_compat 的具体模型名
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// 路由表：模型定义 + 角色映射
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RouterTable {
    #[serde(default)]
    pub models: BTreeMap<String, ModelSpec>,
    #[serde(default)]
    pub routing: BTreeMap<String, String>,
}

impl RouterTable {
    /// 从 TOML 文件加载
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ControlError> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ControlError::ModelUnavailable(format!(
                "router table {} unreadable: {e}",
                path.as_ref().display()
            ))
        })?;
        toml::from_str(&raw)
            .map_err(|e| ControlError::ModelUnavailable(format!("router table parse: {e}")))
    }

    /// 内置的全 null 路由，无配置文件时使用
    pub fn null_table() -> Self {
        let mut models = BTreeMap::new();
        models.insert(
            "null".to_string(),
            ModelSpec {
                kind: "null".to_string(),
                model: None,
                base_url: None,
                capabilities: vec![],
            },
        );
        let routing = ["planner", "executor", "critic", "summarizer"]
            .iter()
            .map(|role| (role.to_string(), "null".to_string()))
            .collect();
        Self { models, routing }
    }

    /// 解析角色对应的 (模型名, 模型定义)
    pub fn resolve(&self, agent: AgentType) -> Result<(&str, &ModelSpec), ControlError> {
        let name = self.routing.get(agent.as_str()).ok_or_else(|| {
            ControlError::ModelUnavailable(format!("no model routed for role {}", agent.as_str()))
        })?;
        let spec = self.models.get(name).ok_or_else(|| {
            ControlError::ModelUnavailable(format!(
                "routed model '{name}' not defined for role {}",
                agent.as_str()
            ))
        })?;
        Ok((name.as_str(), spec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_table_routes_all_roles() {
        let table = RouterTable::null_table();
        for role in [
            AgentType::Planner,
            AgentType::Executor,
            AgentType::Critic,
            AgentType::Summarizer,
        ] {
            let (name, spec) = table.resolve(role).unwrap();
            assert_eq!(name, "null");
            assert_eq!(spec.kind, "null");
        }
    }

    #[test]
    fn test_load_from_toml() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("router.toml");
        std::fs::write(
            &path,
            r#"
[models.null]
kind = "null"

[models.fast]
kind = "openai_compat"
model = "gpt-4o-mini"

[routing]
planner = "fast"
executor = "null"
"#,
        )
        .unwrap();

        let table = RouterTable::load(&path).unwrap();
        let (name, spec) = table.resolve(AgentType::Planner).unwrap();
        assert_eq!(name, "fast");
        assert_eq!(spec.model.as_deref(), Some("gpt-4o-mini"));
        assert!(table.resolve(AgentType::Critic).is_err());
    }
}
