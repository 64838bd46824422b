pub mod bus;
pub mod config;
pub mod dependency;
pub mod task_store;
pub mod types;
