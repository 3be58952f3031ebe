//! Borrow/return ledger.
//!
//! A borrow stays active until the owner approves its return; while active,
//! the same user cannot borrow the same book again. The borrower's
//! `returned` claim and the owner's `return_approved` confirmation are
//! independent flags, and approval requires the claim.

use crate::db::{BorrowedBook, Database, Page, PageRequest};
use crate::error::{AppError, Result};

/// Ledger operations over the borrow_transactions table.
#[derive(Clone)]
pub struct BorrowService {
    db: Database,
}

impl BorrowService {
    /// Create a ledger service.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Borrow a book, returning the new transaction ID.
    pub fn borrow(&self, book_id: i64, borrower_id: &str) -> Result<i64> {
        let book = self
            .db
            .get_book(book_id)?
            .ok_or_else(|| AppError::NotFound(format!("No book found with ID: {}", book_id)))?;

        if !book.is_displayable() {
            return Err(AppError::BookUnavailable(format!(
                "Book {} is archived or not shareable",
                book_id
            )));
        }

        if book.owner_id == borrower_id {
            return Err(AppError::InvalidOperation(
                "You cannot borrow your own book".to_string(),
            ));
        }

        let transaction = self.db.create_borrow_transaction(book_id, borrower_id)?;

        tracing::info!(
            transaction_id = transaction.id,
            book_id,
            borrower_id,
            "Book borrowed"
        );
        Ok(transaction.id)
    }

    /// Borrower claims the book was given back. Repeating the claim is a no-op.
    pub fn mark_returned(&self, transaction_id: i64, requester_id: &str) -> Result<i64> {
        let transaction = self.db.get_borrow_transaction(transaction_id)?.ok_or_else(|| {
            AppError::NotFound(format!("No borrow transaction with ID: {}", transaction_id))
        })?;

        if transaction.user_id != requester_id {
            return Err(AppError::InvalidOperation(
                "Only the borrower can return this book".to_string(),
            ));
        }

        if transaction.returned {
            tracing::debug!(transaction_id, "Return already recorded");
            return Ok(transaction.id);
        }

        self.db.set_transaction_returned(transaction_id)?;
        tracing::info!(transaction_id, "Book marked returned");
        Ok(transaction.id)
    }

    /// Owner confirms a return the borrower has already claimed.
    pub fn approve_return(&self, transaction_id: i64, owner_id: &str) -> Result<i64> {
        let transaction = self.db.get_borrow_transaction(transaction_id)?.ok_or_else(|| {
            AppError::NotFound(format!("No borrow transaction with ID: {}", transaction_id))
        })?;

        let book = self.db.get_book(transaction.book_id)?.ok_or_else(|| {
            AppError::NotFound(format!("No book found with ID: {}", transaction.book_id))
        })?;

        if book.owner_id != owner_id {
            return Err(AppError::InvalidOperation(
                "Only the owner can approve the return of this book".to_string(),
            ));
        }

        if !transaction.returned {
            return Err(AppError::InvalidOperation(
                "The book has not been returned yet".to_string(),
            ));
        }

        self.db.set_transaction_return_approved(transaction_id)?;
        tracing::info!(transaction_id, book_id = book.id, "Return approved");
        Ok(transaction.id)
    }

    /// Whether the user holds an unapproved borrow of the book.
    pub fn is_already_borrowed_by_user(&self, book_id: i64, user_id: &str) -> Result<bool> {
        self.db.is_already_borrowed_by_user(book_id, user_id)
    }

    /// Everything the user has borrowed, newest first.
    pub fn find_all_borrowed_books(
        &self,
        user_id: &str,
        request: PageRequest,
    ) -> Result<Page<BorrowedBook>> {
        self.db.list_borrowed_books(user_id, request)
    }

    /// Returns claimed on the user's own books, newest first.
    pub fn find_all_returned_books(
        &self,
        user_id: &str,
        request: PageRequest,
    ) -> Result<Page<BorrowedBook>> {
        self.db.list_returned_books(user_id, request)
    }
}
