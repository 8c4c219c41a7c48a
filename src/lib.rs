pub mod config;
pub mod errors;
pub mod ingestor;
pub mod mirror;
pub mod models;
pub mod services;
pub mod timeshift;
pub mod utils;
pub mod web;
