//! 模型层：路由表、单槽位路由器与规划后端（null / openai_compat）

pub mod backend;
pub mod null;
pub mod openai_compat;
pub mod profiles;
pub mod router;

pub use backend::{PlanBackend, PlanContext};
pub use null::NullBackend;
pub use openai_compat::OpenAiCompatBackend;
pub use profiles::{ModelSpec, RouterTable};
pub use router::{Acquisition, ModelLease, ModelRouter};
