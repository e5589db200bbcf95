//! Discovery workflow orchestrator - library
//!
//! Durable workflow execution over remote document-processing steps:
//! workflow definitions, the execution engine, the per-execution progress
//! channel and the HTTP control surface.

pub mod broker;
pub mod config;
pub mod context;
pub mod engine;
pub mod events;
pub mod handlers;
pub mod models;
pub mod store;
pub mod tasks;
pub mod types;
pub mod worker;
pub mod ws;
