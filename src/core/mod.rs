//! 核心编排层：类型、错误、Run 状态机、调度、评审团与主控流水线

pub mod council;
pub mod error;
pub mod orchestrator;
pub mod run;
pub mod scheduler;
pub mod types;

pub use council::{Council, CouncilCritic, CouncilOutcome, Verdict};
pub use error::{backoff_delay, ControlError, FailureClass};
pub use orchestrator::{observations_for, spawn_control_plane, Orchestrator};
pub use run::{Run, RunState};
pub use scheduler::RunScheduler;
pub use types::{
    AgentType, CallId, ObservationEvent, ObservationSource, PlanProposal, RunId, RunResult,
    TaskRequest, TickId, ToolCall, ToolInvocation, ToolResult,
};
