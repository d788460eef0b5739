//! Local filesystem backend for the doc-storage engine.
//!
//! Each space is a directory of JSON files; see [`LocalDocBackend`] for the layout.

mod local;

pub mod config;

pub use local::LocalDocBackend;
