mod schema;

pub use schema::Database;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role granted to every registered account.
pub const ROLE_USER: &str = "user";
/// Administrative role.
pub const ROLE_ADMIN: &str = "admin";

/// User account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Unique user ID.
    pub id: String,
    /// First name.
    pub firstname: String,
    /// Last name.
    pub lastname: String,
    /// Email, used as login name.
    pub email: String,
    /// Argon2 password hash.
    #[serde(skip_serializing)]
    pub password_hash: String,
    /// Date of birth (ISO 8601 date).
    pub date_of_birth: Option<String>,
    /// Locked accounts cannot log in.
    pub account_locked: bool,
    /// Accounts stay disabled until activated.
    pub enabled: bool,
    /// Granted roles.
    pub roles: Vec<String>,
    /// Account creation timestamp.
    pub created_at: i64,
    /// Last login timestamp.
    pub last_login: Option<i64>,
}

impl User {
    /// "Firstname Lastname", trimmed.
    pub fn full_name(&self) -> String {
        format!("{} {}", self.firstname, self.lastname)
            .trim()
            .to_string()
    }
}

/// Authentication session.
#[derive(Debug, Clone)]
pub struct Session {
    /// Session token.
    pub token: String,
    /// User ID.
    pub user_id: String,
    /// Expiration timestamp.
    pub expires_at: i64,
}

/// One-time account activation code.
#[derive(Debug, Clone)]
pub struct ActivationToken {
    /// Row ID.
    pub id: i64,
    /// Numeric code sent to the user.
    pub token: String,
    /// User ID.
    pub user_id: String,
    /// Creation timestamp.
    pub created_at: i64,
    /// Expiration timestamp.
    pub expires_at: i64,
    /// Set once the code has been used.
    pub validated_at: Option<i64>,
}

/// Book listed by its owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Book {
    /// Book ID.
    pub id: i64,
    /// Title.
    pub title: String,
    /// Author name.
    pub author_name: String,
    /// ISBN.
    pub isbn: String,
    /// Synopsis.
    pub synopsis: Option<String>,
    /// Path to the stored cover image.
    pub cover: Option<String>,
    /// Archived books are hidden and cannot be borrowed.
    pub archived: bool,
    /// Only shareable books can be borrowed.
    pub shareable: bool,
    /// Owner user ID.
    pub owner_id: String,
    /// Creation timestamp.
    pub created_at: i64,
    /// Last update timestamp.
    pub updated_at: i64,
    /// User that created the row.
    pub created_by: String,
    /// User that last modified the row.
    pub last_modified_by: Option<String>,
}

impl Book {
    /// Archived = false and shareable = true.
    pub fn is_displayable(&self) -> bool {
        !self.archived && self.shareable
    }
}

/// Borrow/return ledger row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BorrowTransaction {
    /// Transaction ID.
    pub id: i64,
    /// Borrowed book.
    pub book_id: i64,
    /// Borrower.
    pub user_id: String,
    /// Borrower claims the book was returned.
    pub returned: bool,
    /// Owner confirmed the return.
    pub return_approved: bool,
    /// Creation timestamp.
    pub created_at: i64,
    /// Last update timestamp.
    pub updated_at: i64,
}

/// Ledger row joined with its book, as listed to users.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BorrowedBook {
    /// Transaction ID.
    pub id: i64,
    /// Book ID.
    pub book_id: i64,
    /// Book title.
    pub title: String,
    /// Book author.
    pub author_name: String,
    /// Book ISBN.
    pub isbn: String,
    /// Average feedback note.
    pub rate: f64,
    /// Borrower claims the book was returned.
    pub returned: bool,
    /// Owner confirmed the return.
    pub return_approved: bool,
    /// Borrower ID.
    pub borrower_id: String,
    /// Transaction creation timestamp.
    pub created_at: i64,
}

/// Rating and comment left on a book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feedback {
    /// Feedback ID.
    pub id: i64,
    /// Rating, 0 to 5.
    pub note: f64,
    /// Comment.
    pub comment: String,
    /// Book ID.
    pub book_id: i64,
    /// Author user ID.
    pub user_id: String,
    /// Creation timestamp.
    pub created_at: i64,
}

/// Zero-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// Page number.
    pub page: u32,
    /// Page size.
    pub size: u32,
}

impl PageRequest {
    /// Largest accepted page size.
    pub const MAX_SIZE: u32 = 100;

    /// Build a request, clamping size to 1..=MAX_SIZE.
    pub fn new(page: u32, size: u32) -> Self {
        Self {
            page,
            size: size.clamp(1, Self::MAX_SIZE),
        }
    }

    /// Row offset.
    pub fn offset(&self) -> i64 {
        self.page as i64 * self.size as i64
    }

    /// Row limit.
    pub fn limit(&self) -> i64 {
        self.size as i64
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(0, 10)
    }
}

/// One page of results with its position in the full listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Page<T> {
    /// Items on this page.
    pub content: Vec<T>,
    /// Page number.
    pub number: u32,
    /// Requested page size.
    pub size: u32,
    /// Items across all pages.
    pub total_elements: u64,
    /// Number of pages.
    pub total_pages: u64,
    /// Whether this is the first page.
    pub first: bool,
    /// Whether this is the last page.
    pub last: bool,
}

impl<T> Page<T> {
    /// Assemble a page from a slice of rows and the total row count.
    pub fn new(content: Vec<T>, request: PageRequest, total_elements: u64) -> Self {
        let total_pages = total_elements.div_ceil(request.size as u64);
        Self {
            content,
            number: request.page,
            size: request.size,
            total_elements,
            total_pages,
            first: request.page == 0,
            last: request.page as u64 + 1 >= total_pages,
        }
    }

    /// Transform every item, keeping the paging metadata.
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            content: self.content.into_iter().map(f).collect(),
            number: self.number,
            size: self.size,
            total_elements: self.total_elements,
            total_pages: self.total_pages,
            first: self.first,
            last: self.last,
        }
    }

    /// Fallible [`Page::map`]; stops at the first error.
    pub fn try_map<U, E>(
        self,
        f: impl FnMut(T) -> std::result::Result<U, E>,
    ) -> std::result::Result<Page<U>, E> {
        let content = self
            .content
            .into_iter()
            .map(f)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Page {
            content,
            number: self.number,
            size: self.size,
            total_elements: self.total_elements,
            total_pages: self.total_pages,
            first: self.first,
            last: self.last,
        })
    }
}

/// Average rating rounded to one decimal.
pub fn round_rate(avg: f64) -> f64 {
    (avg * 10.0).round() / 10.0
}

/// Timestamp helper.
pub fn now_timestamp() -> i64 {
    Utc::now().timestamp()
}

/// Convert timestamp to DateTime.
pub fn timestamp_to_datetime(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_else(Utc::now)
}
