//! Nexis Cloud Console
//!
//! Session authentication, upstream service proxying and server-rendered
//! dashboard pages for Nexis confidential VMs.

pub mod auth;
pub mod config;
pub mod error;
pub mod pages;
pub mod proxy;
pub mod server;
pub mod services;
pub mod store;

pub use config::{ConsoleArgs, ConsoleConfig};
pub use error::{ApiError, ApiResult};
pub use server::{AppState, WebServer};
