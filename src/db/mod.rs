//! Database module: entity models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: view models returned by repositories (counts, snapshots).
//! - `repo`: SQL-only functions that map rows into entities.
//!
//! Every batch status change goes through [`repo::cas_status`], a single
//! conditional `UPDATE` whose `rows_affected()` tells the caller whether it
//! won the transition.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{BatchSnapshot, UnitCounts};
