// src/core/mod.rs - Session tracking core

pub mod clock;
pub mod machine;
pub mod tracker;
pub mod types;
