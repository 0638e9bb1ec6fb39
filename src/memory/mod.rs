//! 记忆层：工作记忆（TTL/容量约束）与情景记忆（SQLite）

pub mod episodic;
pub mod working;

pub use episodic::{Episode, EpisodeQuery, EpisodeStore, EPISODE_SCHEMA_VERSION};
pub use working::{WorkingMemory, WorkingMemoryStats};
