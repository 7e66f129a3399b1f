pub mod config;
pub mod api;
