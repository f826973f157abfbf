pub mod cache;
pub mod client;
pub mod config;
pub mod model;
pub mod parser;
pub mod repository;
pub mod runtime;
