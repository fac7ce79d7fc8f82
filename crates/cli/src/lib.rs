// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

//! Command-line front end for the buildcache two-tier build cache
//!
//! The binary is a thin wrapper: [`cli`] parses arguments and maps errors to
//! exit codes, [`commands`] runs each subcommand against the access stack
//! built from `buildcache.toml`, and [`tracing`] installs the subscriber.

pub mod cli;
pub mod commands;
pub mod tracing;
