pub mod audio;
pub mod client;
pub mod commands;
pub mod config;
pub mod error;
pub mod gateway;
pub mod http;
pub mod snowflake;
pub mod voice;

pub use error::{Error, Result};
