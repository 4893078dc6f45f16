//! # cursor-chat-export
//!
//! Recovers AI chat history from [Cursor](https://cursor.com)'s local storage
//! and exports it as JSON Lines, JSON, YAML or Markdown.
//!
//! ## What it does
//!
//! Cursor keeps conversations in an undocumented SQLite key-value table
//! (`cursorDiskKV` in `globalStorage/state.vscdb`), or in newer builds in a
//! directory of per-session databases. Values are not reliably typed: plain
//! JSON, JSON wrapped in base64 or hex, JSON embedded in binary blobs,
//! `text$uuid` user messages, and opaque reasoning payloads that may be
//! protobuf-like or encrypted.
//!
//! The pipeline:
//!
//! 1. [`storage`] reads raw records from whichever layout exists.
//! 2. [`decode`] recovers structure through an ordered chain of strategies.
//! 3. [`reconstruct`] joins messages to their conversation's header list,
//!    using [`richtext`] to flatten editor documents.
//! 4. [`normalize`] produces the canonical [`normalize::Session`].
//! 5. [`dedup`] drops sessions with identical content.
//! 6. [`cache`] stores the result keyed by the source's modification time.
//!
//! The databases are opened **read-only**; a snapshot of the global store is
//! taken with SQLite's online backup API before it is read.
//!
//! ## Usage
//!
//! ```sh
//! cursor-chat-export list
//! cursor-chat-export show 3f2a9c1e-...
//! cursor-chat-export export --format markdown --output ~/notes/cursor
//! ```
//!
//! Preferences can be persisted in `~/.config/cursor-chat-export/config.toml`.
//!
//! ## Compatibility
//!
//! Tracks Cursor's internal (undocumented) storage. Records that cannot be
//! decoded are skipped and logged, never fatal.

pub mod cache;
pub mod decode;
pub mod dedup;
pub mod error;
pub mod exporter;
pub mod normalize;
pub mod pipeline;
pub mod reconstruct;
pub mod records;
pub mod richtext;
pub mod storage;
pub mod utils;
pub mod workspace;
