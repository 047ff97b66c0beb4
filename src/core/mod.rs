pub mod config;
pub mod cron;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod jobs;
pub mod lifecycle;
pub mod runners;
pub mod store;
pub mod terminal;
pub mod triggers;
