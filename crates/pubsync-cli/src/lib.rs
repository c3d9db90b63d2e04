//! Pubsync CLI - command-line interface for the synchronization engine
//!
//! This crate provides the CLI application that ties together all pubsync components.

pub mod config;

pub use config::{Command, Config, OutputFormat};
