//! bakery core library.
//!
//! Boot-script compilation (block packs, workspace graph, recipes, compiler)
//! and the SD card pipeline (image checks, raw write, remount resolution,
//! install, cleanup) that the `bakery` binary drives.

pub mod blocks;
pub mod boot_config;
pub mod cli;
pub mod compiler;
pub mod config;
pub mod drives;
pub mod elevate;
pub mod graph;
pub mod image;
pub mod installer;
pub mod ipc;
pub mod logging;
pub mod phase;
pub mod progress;
pub mod recipe;
pub mod resolver;
pub mod session;
pub mod validator;
pub mod writer;

pub use bakery_error::{BakeryError, BakeryResult};
