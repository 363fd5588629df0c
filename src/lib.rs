#![forbid(unsafe_code)]

pub mod app;
pub mod cli;
pub mod commands;
pub mod config;
pub mod epub;
pub mod error;
pub mod fetch;
pub mod logging;
