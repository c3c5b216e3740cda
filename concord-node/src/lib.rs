pub mod cli;
pub mod config;
pub mod runtime;
pub mod simulation;

pub use config::Config;
pub use runtime::builder::build_runtime;
