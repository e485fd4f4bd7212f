pub mod api;
pub mod bus;
pub mod config;
pub mod conversations;
pub mod dedup;
pub mod error;
pub mod events;
pub mod friendship;
pub mod http_api;
pub mod logging;
pub mod models;
pub mod notifications;
pub mod session;
pub mod validation;
pub mod ws_bus;

pub use error::{Result, SyncError};
