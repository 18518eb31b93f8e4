pub mod backend;
pub mod config;
pub mod deps;
pub mod ipc;
pub mod process_monitor;
pub mod reaper;
pub mod store;
pub mod supervisor;
pub mod utils;
pub mod workspace;
