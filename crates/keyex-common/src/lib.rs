//! # keyex-common
//!
//! Shared configuration used across all keyex crates.
//! No protocol logic lives here, only settings.

pub mod config;
