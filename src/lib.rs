// src/lib.rs - Library root for studytrack

pub mod auth;
pub mod cli;
pub mod core;
pub mod events;
pub mod gateway;
pub mod geofence;
pub mod infra;
