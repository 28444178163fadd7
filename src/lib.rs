// src/lib.rs

//! flatwatch: polls listing sites and reports every new listing exactly once.

pub mod config;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod scheduler;
pub mod services;
pub mod storage;
pub mod utils;
