//! Application state shared across handlers.

use crate::auth::AuthService;
use crate::config::Config;
use crate::db::Database;
use crate::error::Result;
use crate::service::{BookService, BorrowService, FeedbackService};
use crate::storage::FileStorage;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<Config>,
    /// Database connection.
    pub db: Database,
    /// Authentication service.
    pub auth: Arc<AuthService>,
    /// Book catalogue.
    pub books: BookService,
    /// Borrow/return ledger.
    pub borrowing: BorrowService,
    /// Feedback.
    pub feedback: FeedbackService,
}

/// Aggregate counters.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct Stats {
    /// Registered accounts.
    pub users: u64,
    /// All books.
    pub books: u64,
    /// Books that can currently be borrowed.
    pub displayable_books: u64,
    /// Borrows awaiting return approval.
    pub active_borrows: u64,
}

impl AppState {
    /// Create new application state with database.
    pub fn new_with_db(config: Config, db: Database, auth: AuthService) -> Self {
        let storage = Arc::new(FileStorage::new(&config.storage));

        Self {
            books: BookService::new(db.clone(), storage),
            borrowing: BorrowService::new(db.clone()),
            feedback: FeedbackService::new(db.clone()),
            config: Arc::new(config),
            db,
            auth: Arc::new(auth),
        }
    }

    /// Collect counters.
    pub fn stats(&self) -> Result<Stats> {
        Ok(Stats {
            users: self.db.count_users()?,
            books: self.db.count_books()?,
            displayable_books: self.db.count_displayable_books()?,
            active_borrows: self.db.count_active_borrows()?,
        })
    }

    /// Purge expired sessions periodically. No-op when the interval is 0.
    pub fn start_session_cleanup(&self) {
        let seconds = self.config.auth.cleanup_interval_seconds;
        if seconds == 0 {
            return;
        }

        let db = self.db.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(seconds));
            ticker.tick().await; // Skip first immediate tick

            loop {
                ticker.tick().await;
                match db.cleanup_expired_sessions() {
                    Ok(0) => {}
                    Ok(removed) => tracing::debug!(removed, "Expired sessions purged"),
                    Err(e) => tracing::warn!(error = %e, "Session cleanup failed"),
                }
            }
        });
    }
}
