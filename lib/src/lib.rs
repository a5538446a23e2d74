//! # ostree-toolbox
//!
//! Tools for building ostree-based operating systems.  The main entry point
//! builds a bootable VM disk image from a commit in an ostree repository;
//! see [`provision`].

// See https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![forbid(unused_must_use)]
#![deny(unsafe_code)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::todo)]

pub mod cli;
pub(crate) mod config;
pub mod customize;
pub mod deploy;
pub mod disk;
pub mod error;
pub mod mount;
pub mod preflight;
pub mod provision;
mod reexec;
mod task;
pub mod workspace;
