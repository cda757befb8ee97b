pub mod config;
pub mod handler;
pub mod health;
pub mod notifier;
