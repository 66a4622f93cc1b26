pub mod config;
pub mod models;
pub mod services;
pub mod state;
pub mod store;
pub mod telemetry;
pub mod utils;
