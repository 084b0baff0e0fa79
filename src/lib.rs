pub mod analyzers;
pub mod config;
pub mod error;
pub mod fatv;
pub mod output;
pub mod parser;
pub mod topology;
