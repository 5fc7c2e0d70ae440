pub mod adb;
pub mod artifacts;
pub mod background;
pub mod clock;
pub mod commands;
pub mod config;
pub mod device_ops;
pub mod error;
pub mod logging;
pub mod matcher;
pub mod mirror;
pub mod models;
pub mod perf;
pub mod registry;
pub mod relay;
pub mod rules_store;
pub mod scheduler;
pub mod state;
pub mod supervisor;
