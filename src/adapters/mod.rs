// src/adapters/mod.rs

//! Concrete clients for the collaborator traits in `ports`.

pub mod identity;
pub mod ocr;
pub mod openai;
pub mod qstash;
pub mod storage;
pub mod stripe;
