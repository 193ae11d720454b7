//! The file abstraction the core consumes.
//!
//! The kernel reads binaries, backs mapped zones, and exposes
//! introspection streams through the [`File`] trait; everything behind it,
//! real filesystems and block devices included, is an external
//! collaborator. Path
//! resolution goes through one registered root [`Filesystem`], which the
//! ELF loader uses to open an interpreter.

#![no_std]

extern crate alloc;

mod file;
mod ram_file;

pub use file::{open, register_root, File, Filesystem};
pub use ram_file::{MapFs, RamFile};
