//! Archive the source repositories of F-Droid applications in Software Heritage.
//!
//! The service keeps a local copy of the F-Droid index, ingests its packages
//! into SQLite, and repeatedly submits the least recently archived packages to
//! the Software Heritage "save code now" API, following each save request
//! until it finishes.

pub mod config;
pub mod database;
pub mod error;
pub mod index;
pub mod logging;
pub mod metrics;
pub mod schedule;
pub mod service;
pub mod swh;
pub mod tracker;
pub mod utils;
pub mod vcs;
pub mod web;

pub use error::{Error, Result};
