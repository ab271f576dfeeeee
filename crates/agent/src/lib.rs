//! Fleet agent daemon: HTTP control surface over the agent library

pub mod api;
pub mod config;
pub mod ws;
