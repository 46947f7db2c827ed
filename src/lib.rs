#![forbid(unsafe_code)]

pub mod app;
pub mod cli;
pub mod config;
pub mod detect;
pub mod download;
pub mod fetch;
pub mod fingerprint;
pub mod links;
pub mod logging;
pub mod model;
pub mod notify;
pub mod pages;
pub mod store;
pub mod watch;
