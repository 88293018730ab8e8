#[cfg(not(unix))]
compile_error!("aws-login manages detached Unix processes and only builds on Unix");

pub mod aws;
pub mod cli;
pub mod commands;
pub mod config;
pub mod constants;
pub mod error;
pub mod idp;
pub mod prompt;
pub mod renewal;
pub mod saml;
pub mod secrets;
pub mod session;

pub use error::{Error, Result};
