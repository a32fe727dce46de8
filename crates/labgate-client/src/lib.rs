pub mod access_log;
pub mod channel;
pub mod config;
pub mod context;
pub mod counts;
pub mod directory;
pub mod engine;
pub mod error;
pub mod notify;
pub mod reconciler;
pub mod refresh;
pub mod transport;
pub mod unlock;

pub use context::SyncContext;
pub use engine::Engine;
pub use error::{HttpError, SyncError};
