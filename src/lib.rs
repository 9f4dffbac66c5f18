pub mod api;
pub mod autoscaler;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod retry;
pub mod worker;
