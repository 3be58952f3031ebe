use crate::db::{Book, Database, Page, PageRequest, now_timestamp};
use crate::error::{AppError, Result};
use crate::storage::FileStorage;
use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// Create/update payload.
#[derive(Debug, Clone, Deserialize)]
pub struct BookRequest {
    /// Title.
    pub title: String,
    /// Author name.
    pub author_name: String,
    /// ISBN.
    pub isbn: String,
    /// Synopsis.
    #[serde(default)]
    pub synopsis: Option<String>,
    /// Whether other users may borrow it.
    #[serde(default)]
    pub shareable: bool,
}

impl BookRequest {
    fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(AppError::Validation("Title is mandatory".to_string()));
        }
        if self.author_name.trim().is_empty() {
            return Err(AppError::Validation("Author name is mandatory".to_string()));
        }
        if self.isbn.trim().is_empty() {
            return Err(AppError::Validation("ISBN is mandatory".to_string()));
        }
        Ok(())
    }
}

/// Book as shown to clients.
#[derive(Debug, Clone, Serialize)]
pub struct BookResponse {
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
    /// Owner ID.
    pub owner_id: String,
    /// Owner full name.
    pub owner: String,
    /// Base64 cover bytes.
    pub cover: Option<String>,
    /// Average feedback note.
    pub rate: f64,
    /// Archived flag.
    pub archived: bool,
    /// Shareable flag.
    pub shareable: bool,
}

/// Book catalogue operations.
#[derive(Clone)]
pub struct BookService {
    db: Database,
    storage: Arc<FileStorage>,
}

impl BookService {
    /// Create a catalogue service.
    pub fn new(db: Database, storage: Arc<FileStorage>) -> Self {
        Self { db, storage }
    }

    /// List a new book owned by `owner_id`.
    pub fn save(&self, request: &BookRequest, owner_id: &str) -> Result<i64> {
        request.validate()?;

        let now = now_timestamp();
        let book = Book {
            id: 0, // Auto-increment
            title: request.title.trim().to_string(),
            author_name: request.author_name.trim().to_string(),
            isbn: request.isbn.trim().to_string(),
            synopsis: request.synopsis.clone(),
            cover: None,
            archived: false,
            shareable: request.shareable,
            owner_id: owner_id.to_string(),
            created_at: now,
            updated_at: now,
            created_by: owner_id.to_string(),
            last_modified_by: None,
        };

        let id = self.db.create_book(&book)?;
        tracing::info!(book_id = id, owner_id, "Book created");
        Ok(id)
    }

    /// Edit a book's descriptive fields. Owner only.
    pub fn update(&self, book_id: i64, request: &BookRequest, user_id: &str) -> Result<i64> {
        request.validate()?;
        let book = self.owned_book(book_id, user_id, "update")?;

        let updated = Book {
            title: request.title.trim().to_string(),
            author_name: request.author_name.trim().to_string(),
            isbn: request.isbn.trim().to_string(),
            synopsis: request.synopsis.clone(),
            shareable: request.shareable,
            last_modified_by: Some(user_id.to_string()),
            ..book
        };

        self.db.update_book(&updated)?;
        Ok(book_id)
    }

    /// Fetch one book.
    pub fn find_by_id(&self, book_id: i64) -> Result<BookResponse> {
        let book = self.get(book_id)?;
        self.to_response(book)
    }

    /// Displayable books, newest first.
    pub fn find_all_books(&self, request: PageRequest) -> Result<Page<BookResponse>> {
        let page = self.db.list_displayable_books(request)?;
        self.to_response_page(page)
    }

    /// All books of the owner, including archived and private ones.
    pub fn find_all_books_by_owner(
        &self,
        owner_id: &str,
        request: PageRequest,
    ) -> Result<Page<BookResponse>> {
        let page = self.db.list_books_by_owner(owner_id, request)?;
        self.to_response_page(page)
    }

    /// Flip the shareable flag. Owner only.
    pub fn update_shareable_status(&self, book_id: i64, user_id: &str) -> Result<i64> {
        let book = self.owned_book(book_id, user_id, "change the shareable status of")?;
        self.db.set_book_shareable(book_id, !book.shareable, user_id)?;
        tracing::info!(book_id, shareable = !book.shareable, "Shareable status changed");
        Ok(book_id)
    }

    /// Flip the archived flag. Owner only.
    pub fn update_archived_status(&self, book_id: i64, user_id: &str) -> Result<i64> {
        let book = self.owned_book(book_id, user_id, "change the archived status of")?;
        self.db.set_book_archived(book_id, !book.archived, user_id)?;
        tracing::info!(book_id, archived = !book.archived, "Archived status changed");
        Ok(book_id)
    }

    /// Store a new cover for the book. Owner only.
    pub fn upload_cover(&self, book_id: i64, user_id: &str, bytes: &[u8]) -> Result<i64> {
        let book = self.owned_book(book_id, user_id, "upload a cover for")?;
        let path = self.storage.save_cover(&book.owner_id, bytes)?;
        self.db
            .set_book_cover(book_id, &path.to_string_lossy(), user_id)?;
        Ok(book_id)
    }

    /// Path of the stored cover, if any. Hidden books only show theirs to the owner.
    pub fn cover_path(&self, book_id: i64, user_id: &str) -> Result<Option<PathBuf>> {
        let book = self.get(book_id)?;
        if !book.is_displayable() && book.owner_id != user_id {
            return Err(AppError::BookUnavailable(format!(
                "Book {} is archived or not shareable",
                book_id
            )));
        }
        Ok(book.cover.map(PathBuf::from))
    }

    fn get(&self, book_id: i64) -> Result<Book> {
        self.db
            .get_book(book_id)?
            .ok_or_else(|| AppError::NotFound(format!("No book found with ID: {}", book_id)))
    }

    fn owned_book(&self, book_id: i64, user_id: &str, action: &str) -> Result<Book> {
        let book = self.get(book_id)?;
        if book.owner_id != user_id {
            return Err(AppError::InvalidOperation(format!(
                "You cannot {} books you do not own",
                action
            )));
        }
        Ok(book)
    }

    fn to_response_page(&self, page: Page<Book>) -> Result<Page<BookResponse>> {
        page.try_map(|book| self.to_response(book))
    }

    fn to_response(&self, book: Book) -> Result<BookResponse> {
        let owner = self
            .db
            .get_user_by_id(&book.owner_id)?
            .map(|u| u.full_name())
            .unwrap_or_default();
        let rate = self.db.book_rate(book.id)?;

        let cover = match &book.cover {
            Some(path) => self
                .storage
                .read_file(std::path::Path::new(path))?
                .map(|bytes| STANDARD.encode(bytes)),
            None => None,
        };

        Ok(BookResponse {
            id: book.id,
            title: book.title,
            author_name: book.author_name,
            isbn: book.isbn,
            synopsis: book.synopsis,
            owner_id: book.owner_id,
            owner,
            cover,
            rate,
            archived: book.archived,
            shareable: book.shareable,
        })
    }
}
