//! The transfer task engine: a single-writer supervisor drives every active
//! transfer through resolve → stage → payload transfer → manifest delivery,
//! checkpointing its in-flight table across restarts.
//!
//! Partial failures are not rolled back: files copied before a failure or a
//! cancellation remain at the destination, and the manifest is only delivered
//! when the whole payload succeeded.

pub mod checkpoint;
pub mod manifest;
pub mod supervisor;
pub mod task;

pub use supervisor::{SupervisorOptions, TaskClient, TaskSupervisor, TransferRequest};
pub use task::{EngineContext, TransferTask};
