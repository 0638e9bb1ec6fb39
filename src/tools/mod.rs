//! 工具层：注册表、审批闸门、沙箱、工件仓库与唯一执行通道

pub mod approval;
pub mod choke;
pub mod fs_list;
pub mod fs_read;
pub mod git_apply;
pub mod git_diff;
pub mod http_fetch;
pub mod registry;
pub mod sandbox;
pub mod shell;
pub mod store;

pub use approval::{ApprovalBroker, ApprovalGrant, ApprovalOutcome, ExecutionArm, PendingApproval};
pub use choke::{validate_args, ToolChokePoint};
pub use fs_list::FsListTool;
pub use fs_read::FsReadTool;
pub use git_apply::GitApplyTool;
pub use git_diff::GitDiffTool;
pub use http_fetch::HttpFetchTool;
pub use registry::{proposal_schema_json, Tool, ToolRegistry};
pub use sandbox::{Capabilities, Sandbox};
pub use shell::ShellTool;
pub use store::{ArtifactRef, ArtifactStore};
