pub mod app;
pub mod broadcast;
pub mod config;
pub mod export;
pub mod graph;
pub mod migrate;
pub mod model;
pub mod ping;
pub mod registration;
pub mod scheduler;
pub mod store;
pub mod time;
