//! Common types shared across the classroom session crates.

#![warn(clippy::pedantic)]

/// Module for identifier newtypes
pub mod types;

/// Module for secret types that prevent accidental logging of issued tokens
pub mod secret;
