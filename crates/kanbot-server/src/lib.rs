pub mod handlers;
pub mod server;

pub use handlers::{ApiError, HandlerState};
pub use server::{start, ServerConfig, ServerHandle};
