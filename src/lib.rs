//! chatrelay library root.

pub mod agent;
pub mod cli;
pub mod config;
pub mod error;
pub mod executor;
pub mod hub;
pub mod logging;
pub mod store;
pub mod telegram;

pub use agent::Agent;
pub use cli::Commands;
pub use config::{load_settings, Settings};
pub use error::{Error, Result};
pub use executor::{ExecError, Execution, Executor};
pub use hub::{run_hub, Delivery, Hub};
pub use store::Store;
pub use telegram::{InboundMessage, Messenger};
