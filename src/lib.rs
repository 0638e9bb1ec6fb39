//! Hive - Rust 智能体编排控制平面
//!
//! 模型只提议，控制面才应用。模块划分：
//! - **audit**: 追加式审计日志（哈希链 + 无空洞 seq）与回放恢复
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 类型、错误、Run 状态机、调度、评审团与编排主控
//! - **memory**: 工作记忆（TTL/容量）与情景记忆（SQLite）
//! - **models**: 模型路由（单槽位 + FCFS 换载）与规划后端
//! - **policy**: 纯函数策略引擎与脱敏规则
//! - **state**: StateDelta 与状态仓库适配器
//! - **tools**: 工具注册表、审批闸门、沙箱与唯一执行通道
//! - **server**: HTTP 控制面（feature = "server"）

pub mod audit;
pub mod config;
pub mod core;
pub mod memory;
pub mod models;
pub mod observability;
pub mod policy;
#[cfg(feature = "server")]
pub mod server;
pub mod state;
pub mod tools;

pub use crate::core::{Orchestrator, RunResult, TaskRequest};
