pub mod auth;
pub mod config;
pub mod metrics;
pub mod node;
pub mod tags;
pub mod threshold;
