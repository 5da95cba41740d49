pub mod account;
pub mod admin;
pub mod auth;
pub mod claudeconv;
pub mod config;
pub mod deepseek;
pub mod error;
pub mod format;
pub mod gateway;
pub mod logging;
pub mod prompt;
pub mod sse;
pub mod stream;
pub mod toolcall;
pub mod util;
