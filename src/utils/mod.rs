// src/utils/mod.rs
pub mod error_collector;
pub mod logging;
pub mod symbol;
