pub mod assets;
pub mod config;
pub mod reporter;
pub mod service;
