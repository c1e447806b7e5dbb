pub mod broker;
pub mod config;
pub mod error;
pub mod logger;
pub mod orchestrator;
pub mod process;
pub mod processors;
pub mod resolver;
pub mod retry;
pub mod runner;

pub use rdfc_processor::ir;
