// src/models/mod.rs

pub mod billing;
pub mod card_set;
pub mod question;
pub mod submission;
pub mod user;
