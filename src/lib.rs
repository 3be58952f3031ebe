//! book-network: a social network for lending books between readers.
//!
//! Members list the books they own, borrow shareable books from each
//! other, confirm returns and leave feedback. Every borrow goes through
//! a ledger of transactions that the owner must approve before the book
//! can be lent again.
//!
//! # Features
//!
//! - Account registration with emailed activation codes
//! - Book catalogue with covers, sharing and archiving
//! - Borrow/return ledger with owner approval
//! - Ratings and comments
//! - Paged listings

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Authentication and user management.
pub mod auth;
/// Configuration and CLI.
pub mod config;
/// Database operations.
pub mod db;
/// Error types.
pub mod error;
/// Outgoing mail.
pub mod mail;
/// HTTP server.
pub mod server;
/// Catalogue, ledger and feedback rules.
pub mod service;
/// Uploaded file storage.
pub mod storage;

#[cfg(test)]
mod tests;

pub use config::{Cli, Command, Config};
pub use db::Database;
pub use error::{AppError, ErrorKind, Result};
pub use server::AppState;
