//! vellum: an embedded, transactional, page-based storage engine.
//!
//! vellum keeps named B+ trees inside a single directory and gives callers
//! snapshot-isolated transactions over them:
//!
//! - **Single writer, many readers**: one write transaction at a time, any
//!   number of read transactions, none of them blocking each other
//! - **Write-ahead journal**: every commit is one sealed, checksummed entry;
//!   recovery replays journals deterministically
//! - **MVCC page translation**: committed page versions accumulate in
//!   scratch files and each snapshot resolves the version it is entitled to
//! - **Lazy or safe durability**: per-commit choice between fsync-now and
//!   buffer-until-later, without ever risking store consistency
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │             Environment API                  │
//! │    (create, open, read, write, sync)        │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │            Transaction Layer                 │
//! │ (snapshot pinning, buffered writes, commit) │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │              B+ Tree Layer                   │
//! │     (named trees, catalog, overflow)        │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │       Journal + Page Translation             │
//! │  (sealed entries, per-journal PTT, replay)  │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │        Scratch Pool + Data File              │
//! │   (page versions, flush, dual-slot header)  │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use vellum::Environment;
//!
//! let env = Environment::create("/var/lib/my-app/store")?;
//!
//! // Write transaction: buffered until commit.
//! let mut txn = env.write()?;
//! let mut users = txn.create_tree("users")?;
//! users.insert(b"alice", b"admin")?;
//! txn.commit()?;
//!
//! // Read transaction: a pinned snapshot.
//! let txn = env.read()?;
//! let users = txn.tree("users")?;
//! assert_eq!(users.get(b"alice")?, Some(b"admin".to_vec()));
//! # Ok::<(), vellum::Error>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
// Explicit drops release node borrows on pages before the page is handed on
#![allow(clippy::drop_non_drop)]
// Split propagation returns promoted separator/child pairs next to old values
#![allow(clippy::type_complexity)]

pub mod btree;
pub mod config;
pub mod env;
pub mod error;
mod fileio;
pub mod journal;
pub mod page;
pub mod ptt;
pub mod registry;
pub mod scratch;
pub mod transaction;

// Re-export commonly used types
pub use btree::{BTree, PageProvider};
pub use config::EnvironmentOptions;
pub use env::{Environment, EnvironmentStats, DATA_FILE_NAME};
pub use error::{Error, PageId, PageType, Result, TxId};
pub use journal::Durability;
pub use page::{Page, PAGE_HEADER_SIZE};
pub use transaction::{ReadTransaction, Tree, TreeReader, WriteTransaction};
