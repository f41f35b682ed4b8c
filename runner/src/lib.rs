pub mod config;
pub mod database;
pub mod description;
pub mod distributed;
pub mod executors;
pub mod logging;
pub mod resources;
pub mod scheduler;
pub mod sync;
