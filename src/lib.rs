// Public API for integration tests and the server binary

pub mod abuse;
pub mod api;
pub mod auth;
pub mod chat;
pub mod events;
pub mod geo;
pub mod llm;
pub mod protocol;
pub mod state;
pub mod storage;
pub mod types;
pub mod ws;
