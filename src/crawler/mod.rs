pub mod coordinator;
pub mod supervisor;
pub mod sweep;
pub mod task;
pub mod worker;

// Re-export common types
pub use coordinator::{Coordinator, RunRequest, RunState, RunSummary};
pub use supervisor::{Supervisor, WorkerCommand};
pub use task::{Location, SearchTask, VillageTask};
pub use worker::{Worker, WorkerChannels, WorkerStats};
