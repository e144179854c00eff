pub mod blockchain;
pub mod config;
pub mod node;
