pub mod errors;
pub mod proto;
pub mod task;

pub use proto::{CommandReply, CommandRequest};
pub use task::{TaskArgs, TaskState, TimeoutAction};
