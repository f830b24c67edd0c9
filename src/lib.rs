pub mod config;
pub mod controller;
pub mod error;
pub mod logging;
pub mod ssh;
pub mod state;
pub mod terminal;
pub mod vault;

pub use error::{AppError, AppResult};
