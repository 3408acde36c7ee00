pub mod access;
pub mod api;
pub mod app;
pub mod auth;
pub mod config;
pub mod cors;
pub mod db;
pub mod documents;
pub mod error;
pub mod metrics;
pub mod presence;
pub mod relay;
pub mod ws;
