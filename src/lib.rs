pub mod commands;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod logging;

pub use commands::GpoService;
pub use config::Settings;
pub use error::{AppError, AppResult, CommandError};
