//! Command handlers

pub mod admin;
pub mod config;
pub mod entity;
pub mod status;
pub mod sync;
pub mod watch;
