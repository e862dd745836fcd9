pub mod broadcaster;
pub mod config;
pub mod connections;
pub mod devices;
pub mod events;
pub mod permissions;
pub mod push;
pub mod queue;
pub mod retry_queue;
pub mod sessions;
pub mod tasks;
