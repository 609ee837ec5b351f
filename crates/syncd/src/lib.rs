// apiforge-syncd library entry point.

pub mod auth;
pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod relay;
pub mod retry;
pub mod scope;
pub mod session;
pub mod store;
pub mod ws;
