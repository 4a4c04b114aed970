pub mod billing;
pub mod config;
pub mod db;
pub mod error;
pub mod fiscal;
pub mod models;
pub mod worker;
