pub mod backend;
pub mod binder;
pub mod capability;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod doctor;
pub mod error;
pub mod memory;
pub mod openai;
pub mod orchestrator;
pub mod pipeline;
pub mod profiles;
pub mod provider;
pub mod session;
pub mod sink;
pub mod telemetry;
pub mod transcript;
pub mod worker;
