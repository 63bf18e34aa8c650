//! Database module: SQLite pool setup and SQL repositories.
//!
//! Two stores live here, both exposed as free functions over a shared pool:
//! - the generation record store (`image_generations`, append-only), and
//! - the default settings store (`default_settings`, one row per scope).
//!
//! External modules should import from `tg_imaginebot::db` — the repository
//! API is re-exported at this level.

pub mod repo;

pub use repo::*;
