pub mod config;
pub mod error;
pub mod events;
pub mod http;
pub mod plugin;
pub mod registry;
pub mod services;
pub mod subscriptions;
pub mod types;

pub use config::Config;
pub use error::{ApiError, DispatchError, ErrorKind};
pub use plugin::Plugin;
