//! # Merkle Sync
//!
//! Incremental, content-addressed synchronization between a watched
//! source tree and a remote code index.
//!
//! The client keeps a hash tree over its tracked files. One root
//! comparison tells it whether anything changed; when something did, it
//! describes the changed fragments by hash only, and sends content just
//! for the hashes the server has never seen from any caller.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌─────────────┐   ┌──────────────┐
//! │ ChangeWatcher│──▶│ WatchPipeline│──▶│ snapshot.json │
//! │  (external)  │   │  HashTree    │   │  dirty.json   │
//! └──────────────┘   └─────────────┘   └──────┬───────┘
//!                                             │ msync sync
//!                                             ▼
//!                  ┌──────────────────────────────────────┐
//!                  │ HTTP: check → phase1 → phase2 / full │
//!                  └──────────────────┬───────────────────┘
//!                                     ▼
//!              ┌────────────┐   ┌──────────────┐   ┌──────────┐
//!              │ SyncService │──▶│ ContentCache  │──▶│  SQLite   │
//!              │ + processor │   │ frag/payload  │   │ kv table  │
//!              └────────────┘   └──────────────┘   └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! msync init                    # create database and state dir
//! msync token alice             # mint a credential
//! msync serve                   # start the sync server
//! msync snapshot                # hash the project, mark changes dirty
//! msync sync                    # push changes to the server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`scan`] | Project walking and leaf hashing |
//! | [`state_store`] | Durable snapshot and dirty queue |
//! | [`watcher`] | Change-watcher contract and tree update pipeline |
//! | [`client`] | Client sync driver |
//! | [`cache`] | Content-addressed cache over the KV store |
//! | [`sync`] | Server side of the protocol |
//! | [`processing`] | Summary and embedding backends |
//! | [`auth`] | Credential verification |
//! | [`server`] | HTTP server |
//! | [`sqlite_kv`] | SQLite key-value store |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod auth;
pub mod cache;
pub mod client;
pub mod config;
pub mod db;
pub mod migrate;
pub mod processing;
pub mod scan;
pub mod server;
pub mod sqlite_kv;
pub mod state_store;
pub mod sync;
pub mod watcher;
