pub mod config;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod ledger;
pub mod notifier;
pub mod providers;
pub mod push;
pub mod reconciler;
pub mod server;
