pub mod archive;
pub mod config;
pub mod coordinator;
pub mod dashboard;
pub mod error;
pub mod job;
pub mod network;
pub mod node;
pub mod protocol;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod timer;
