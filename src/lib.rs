pub mod api;
pub mod client;
pub mod config;
pub mod conversation;
pub mod error;
pub mod inference;
pub mod logging;
pub mod model;
