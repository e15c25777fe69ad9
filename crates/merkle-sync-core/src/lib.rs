//! # Merkle Sync Core
//!
//! Shared, WASM-safe logic for Merkle Sync: the content-addressed hash
//! tree, data models and wire types, the error taxonomy, the key-value
//! storage contract, and the fragment-processing trait.
//!
//! This crate contains no tokio, sqlx, filesystem I/O, or other
//! native-only dependencies. It compiles to both native targets and
//! `wasm32-unknown-unknown`.

pub mod error;
pub mod fragment;
pub mod merkle;
pub mod models;
pub mod processing;
pub mod store;

pub use error::{AuthError, SyncError};
pub use merkle::{HashNode, HashTree, TreeChange, EMPTY_ROOT};
pub use models::{CallerIdentity, Fragment, FragmentKind, Leaf, TreeSnapshot};
