pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod feed;
pub mod logger;
pub mod models;
pub mod scheduler;

pub use db::Database;
pub use error::{FetchError, StoreError};
pub use feed::{FeedSource, Fetcher};
pub use scheduler::{CycleReport, Scheduler, SchedulerConfig, StopHandle};
