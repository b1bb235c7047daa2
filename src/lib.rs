pub mod config;
pub mod db;
pub mod errors;
pub mod logging;
pub mod orchestrator;
pub mod server;
pub mod session;
pub mod stream;
