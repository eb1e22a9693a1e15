pub mod app;
pub mod aria2;
pub mod catalog;
pub mod checksum;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod locate;
pub mod output;
pub mod resolver;
pub mod store;
pub mod template;
