pub mod api;
pub mod config;
pub mod constants;
pub mod crypto;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod sync;
pub mod utils;
pub mod websocket;
