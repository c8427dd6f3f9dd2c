pub mod config;
pub mod messages;
pub mod odrive;
pub mod runtime;
