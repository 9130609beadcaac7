#![forbid(unsafe_code)]

pub mod api;
pub mod app;
pub mod browser;
pub mod cache;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod logging;
pub mod model;
pub mod protection;
pub mod resolve;
