// src/services/mod.rs

pub mod chunking;
pub mod extraction;
pub mod ledger;
pub mod pipeline;
pub mod resolver;
pub mod scoring;
