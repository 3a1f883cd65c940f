pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod lifecycle;
pub mod output;
pub mod repository;
pub mod service;
