use crate::db::{Database, Feedback, Page, PageRequest, now_timestamp};
use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};

/// Highest accepted note.
pub const MAX_NOTE: f64 = 5.0;

/// Feedback payload.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedbackRequest {
    /// Rating, 0 to 5.
    pub note: f64,
    /// Comment.
    pub comment: String,
    /// Rated book.
    pub book_id: i64,
}

/// Feedback as shown to clients.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FeedbackResponse {
    /// Feedback ID.
    pub id: i64,
    /// Rating.
    pub note: f64,
    /// Comment.
    pub comment: String,
    /// Whether the caller wrote it.
    pub own_feedback: bool,
    /// Creation timestamp.
    pub created_at: i64,
}

/// Feedback operations.
#[derive(Clone)]
pub struct FeedbackService {
    db: Database,
}

impl FeedbackService {
    /// Create a feedback service.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Rate a displayable book the user does not own.
    ///
    /// Several feedbacks from the same user on the same book are accepted.
    pub fn save(&self, request: &FeedbackRequest, user_id: &str) -> Result<i64> {
        if !(0.0..=MAX_NOTE).contains(&request.note) {
            return Err(AppError::Validation(format!(
                "Note must be between 0 and {}",
                MAX_NOTE
            )));
        }
        if request.comment.trim().is_empty() {
            return Err(AppError::Validation("Comment is mandatory".to_string()));
        }

        let book = self.db.get_book(request.book_id)?.ok_or_else(|| {
            AppError::NotFound(format!("No book found with ID: {}", request.book_id))
        })?;

        if !book.is_displayable() {
            return Err(AppError::BookUnavailable(
                "You cannot give feedback for an archived or not shareable book".to_string(),
            ));
        }
        if book.owner_id == user_id {
            return Err(AppError::InvalidOperation(
                "You cannot give feedback to your own book".to_string(),
            ));
        }

        let feedback = Feedback {
            id: 0, // Auto-increment
            note: request.note,
            comment: request.comment.trim().to_string(),
            book_id: book.id,
            user_id: user_id.to_string(),
            created_at: now_timestamp(),
        };

        let id = self.db.create_feedback(&feedback)?;
        tracing::info!(feedback_id = id, book_id = book.id, "Feedback saved");
        Ok(id)
    }

    /// Feedback on a book, flagging the caller's own entries.
    pub fn find_all_feedbacks_by_book(
        &self,
        book_id: i64,
        user_id: &str,
        request: PageRequest,
    ) -> Result<Page<FeedbackResponse>> {
        if self.db.get_book(book_id)?.is_none() {
            return Err(AppError::NotFound(format!(
                "No book found with ID: {}",
                book_id
            )));
        }

        let page = self.db.list_feedbacks_by_book(book_id, request)?;
        Ok(page.map(|f| FeedbackResponse {
            own_feedback: f.user_id == user_id,
            id: f.id,
            note: f.note,
            comment: f.comment,
            created_at: f.created_at,
        }))
    }

    /// Average note, rounded to one decimal.
    pub fn rate(&self, book_id: i64) -> Result<f64> {
        self.db.book_rate(book_id)
    }
}
