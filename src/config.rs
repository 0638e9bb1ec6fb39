//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，
//! 如 `HIVE__POLICY__ALLOW_EXEC=true`）。

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::policy::{PolicyConfig, RiskClass};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub policy: PolicySection,
    #[serde(default)]
    pub approval: ApprovalSection,
    #[serde(default)]
    pub router: RouterSection,
    #[serde(default)]
    pub memory: MemorySection,
    #[serde(default)]
    pub council: CouncilSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub tools: ToolsSection,
}

/// [app] 段：运行时目录与 workspace 沙箱根
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub runtime_root: PathBuf,
    pub workspace_root: PathBuf,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            runtime_root: PathBuf::from("runtime"),
            workspace_root: PathBuf::from("workspace"),
        }
    }
}

impl AppSection {
    pub fn audit_log_path(&self) -> PathBuf {
        self.runtime_root.join("logs").join("audit.jsonl")
    }

    pub fn episodes_path(&self) -> PathBuf {
        self.runtime_root.join("memory").join("episodes.db")
    }
}

/// [policy] 段：风险类开关与按工具覆盖
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicySection {
    pub allow_exec: bool,
    pub allow_network: bool,
    pub allow_write: bool,
    /// 工具名 -> 风险类（read / write / exec / network）
    pub risk_overrides: BTreeMap<String, String>,
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            allow_exec: false,
            allow_network: false,
            allow_write: true,
            risk_overrides: BTreeMap::new(),
        }
    }
}

impl PolicySection {
    pub fn to_policy_config(&self) -> PolicyConfig {
        let mut overrides = BTreeMap::new();
        for (tool, risk) in &self.risk_overrides {
            let parsed = match risk.to_lowercase().as_str() {
                "read" => Some(RiskClass::Read),
                "write" => Some(RiskClass::Write),
                "exec" => Some(RiskClass::Exec),
                "network" => Some(RiskClass::Network),
                _ => None,
            };
            match parsed {
                Some(r) => {
                    overrides.insert(tool.clone(), r);
                }
                None => tracing::warn!(tool = %tool, risk = %risk, "ignoring unknown risk override"),
            }
        }
        PolicyConfig {
            allow_exec: self.allow_exec,
            allow_network: self.allow_network,
            allow_write: self.allow_write,
            risk_overrides: overrides,
        }
    }
}

/// [approval] 段：审窗与静态 token（无头运行用）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApprovalSection {
    pub window_secs: u64,
    pub token: Option<String>,
}

impl Default for ApprovalSection {
    fn default() -> Self {
        Self {
            window_secs: 120,
            token: None,
        }
    }
}

/// [router] 段：路由表位置、换载 SLO 与规划等待上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterSection {
    pub table_path: PathBuf,
    pub swap_slo_ms: u64,
    /// 等待模型提议的超时（秒）；超时按 ModelUnavailable 处理
    pub plan_timeout_secs: u64,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            table_path: PathBuf::from("config/router.toml"),
            swap_slo_ms: 2000,
            plan_timeout_secs: 60,
        }
    }
}

/// [memory] 段：工作记忆上限与 TTL
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    pub working_max_entries: usize,
    pub working_ttl_secs: u64,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            working_max_entries: 256,
            working_ttl_secs: 600,
        }
    }
}

/// [council] 段：评审团（可选扩展点）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CouncilSection {
    pub enabled: bool,
    /// 分歧达到该票数即升级为强制审批
    pub disagreement_threshold: usize,
    /// diff 触碰文件数超过该值由评审团升级
    pub max_diff_files: usize,
}

impl Default for CouncilSection {
    fn default() -> Self {
        Self {
            enabled: false,
            disagreement_threshold: 1,
            max_diff_files: 8,
        }
    }
}

/// [server] 段：HTTP 控制面；默认仅 loopback，外部暴露必须配 auth token
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,
    pub auth_token: Option<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7700".to_string(),
            auth_token: None,
        }
    }
}

/// [tools] 段：超时、重试与各工具配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    /// transient 失败的最大尝试次数（含首次）
    pub max_attempts: u32,
    /// 退避基数（毫秒）
    pub retry_base_ms: u64,
    /// 策略拒绝后的重新规划次数上限（默认 0，即拒绝立即失败）
    pub replan_on_denial: u32,
    #[serde(default)]
    pub shell: ShellSection,
    #[serde(default)]
    pub http: HttpSection,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 30,
            max_attempts: 3,
            retry_base_ms: 200,
            replan_on_denial: 0,
            shell: ShellSection::default(),
            http: HttpSection::default(),
        }
    }
}

/// [tools.shell] 段：允许执行的命令名（仅首词，如 ls、grep、cargo）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShellSection {
    pub allowed_commands: Vec<String>,
}

impl Default for ShellSection {
    fn default() -> Self {
        Self {
            allowed_commands: vec![
                "ls".into(),
                "grep".into(),
                "cat".into(),
                "head".into(),
                "tail".into(),
                "wc".into(),
                "find".into(),
                "cargo".into(),
                "rustc".into(),
            ],
        }
    }
}

/// [tools.http] 段：抓取超时、结果上限与域名白名单
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpSection {
    pub timeout_secs: u64,
    pub max_result_chars: usize,
    pub allowed_domains: Vec<String>,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            timeout_secs: 15,
            max_result_chars: 8000,
            allowed_domains: vec![
                "github.com".into(),
                "raw.githubusercontent.com".into(),
                "docs.rs".into(),
                "crates.io".into(),
                "doc.rust-lang.org".into(),
            ],
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app: AppSection::default(),
            policy: PolicySection::default(),
            approval: ApprovalSection::default(),
            router: RouterSection::default(),
            memory: MemorySection::default(),
            council: CouncilSection::default(),
            server: ServerSection::default(),
            tools: ToolsSection::default(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
