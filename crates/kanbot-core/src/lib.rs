pub mod agents;
pub mod errors;
pub mod gateway;
pub mod ids;
pub mod task;

pub use agents::{AgentDirectory, DirectoryError};
pub use errors::GatewayError;
pub use gateway::{AgentGateway, SpawnReceipt, SpawnRequest, TaskContext};
pub use ids::{AgentId, RunId, SessionKey, TaskId};
pub use task::{NewTask, SpawnState, Task, TaskStatus};
