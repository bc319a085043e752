// src/connectors/mod.rs
pub mod paper;
pub mod retry;
pub mod traits;
