// src/handlers/mod.rs

pub mod auth;
pub mod billing;
pub mod card_set;
pub mod upload;
pub mod webhooks;
