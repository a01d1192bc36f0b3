//! Read-only projection of a source directory where multi-volume RAR
//! archives appear as their contained files, selected directories are
//! flattened into their parents, and filtered names are hidden.
//!
//! The crate is organized around the three core components of the design:
//! [`archive`] parses the RAR block format and serves partial reads of
//! store-method entries, [`resolver`] computes the virtual-path projection
//! over a source tree, and [`cache`] supervises the external extractor used
//! for compressed entries. [`fs`] wires all three together behind a
//! [`fuser::Filesystem`] implementation.

#[macro_use]
mod macros;

pub mod archive;
pub mod cache;
pub mod config;
pub mod error;
pub mod fs;
mod read;
pub mod resolver;
