#![allow(clippy::uninlined_format_args)]

pub mod app;
pub mod archive;
pub mod config;
pub mod data;
pub mod feed;
pub mod lifecycle;
pub mod player;
pub mod storage;
pub mod ui;
pub mod visibility;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use app::run;
