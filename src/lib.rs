//! Bunch realtime gateway library.
//! This crate exposes internal modules for integration testing.
//! The binary entry point is in main.rs.

pub mod auth;
pub mod config;
pub mod error;
pub mod reactions;
pub mod registry;
pub mod routes;
pub mod state;
pub mod store;
pub mod topics;
pub mod ws;
