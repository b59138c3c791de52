pub mod cache;
pub mod checker;
pub mod code;
pub mod config;
pub mod context;
pub mod environment;
pub mod error;
pub mod package;
pub mod queue;
pub mod sandbox;
pub mod solutions;
pub mod verdict;
pub mod worker;
