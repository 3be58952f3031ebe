use crate::db::*;
use crate::error::{AppError, Result};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, ToSql, TransactionBehavior, params};
use std::path::Path;
use std::sync::Arc;

const USER_COLUMNS: &str = "id, firstname, lastname, email, password_hash, date_of_birth, \
                            account_locked, enabled, created_at, last_login";

const BOOK_COLUMNS: &str = "id, title, author_name, isbn, synopsis, cover, archived, shareable, \
                            owner_id, created_at, updated_at, created_by, last_modified_by";

const BORROWED_BOOK_SELECT: &str = "SELECT t.id, t.book_id, b.title, b.author_name, b.isbn,
            COALESCE((SELECT AVG(f.note) FROM feedbacks f WHERE f.book_id = b.id), 0.0),
            t.returned, t.return_approved, t.user_id, t.created_at
     FROM borrow_transactions t
     JOIN books b ON b.id = t.book_id";

/// True for UNIQUE violations, which callers translate into domain errors.
fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn is_foreign_key_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY
    )
}

/// Run a COUNT query and a LIMIT/OFFSET query sharing the same filter arguments.
fn query_page<T>(
    conn: &Connection,
    count_sql: &str,
    select_sql: &str,
    args: &[&dyn ToSql],
    request: PageRequest,
    map: fn(&Row<'_>) -> rusqlite::Result<T>,
) -> rusqlite::Result<Page<T>> {
    let total: i64 = conn.query_row(count_sql, args, |row| row.get(0))?;

    let sql = format!("{} LIMIT ? OFFSET ?", select_sql);
    let limit = request.limit();
    let offset = request.offset();
    let mut all_args: Vec<&dyn ToSql> = args.to_vec();
    all_args.push(&limit);
    all_args.push(&offset);

    let mut stmt = conn.prepare(&sql)?;
    let content = stmt
        .query_map(&*all_args, map)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(Page::new(content, request, total.max(0) as u64))
}

fn load_roles(conn: &Connection, user_id: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT role FROM user_roles WHERE user_id = ?1 ORDER BY role")?;
    stmt.query_map(params![user_id], |row| row.get(0))?
        .collect()
}

/// Database wrapper for thread-safe access.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| AppError::Internal(format!("Failed to open database: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_schema()?;
        Ok(db)
    }

    /// Open in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| AppError::Internal(format!("Failed to open database: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_schema()?;
        Ok(db)
    }

    /// Initialize database schema.
    fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            -- Users table
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                firstname TEXT NOT NULL DEFAULT '',
                lastname TEXT NOT NULL DEFAULT '',
                email TEXT UNIQUE NOT NULL,
                password_hash TEXT NOT NULL,
                date_of_birth TEXT,
                account_locked INTEGER NOT NULL DEFAULT 0,
                enabled INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                last_login INTEGER
            );

            -- Role grants
            CREATE TABLE IF NOT EXISTS user_roles (
                user_id TEXT NOT NULL,
                role TEXT NOT NULL,
                PRIMARY KEY (user_id, role),
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );

            -- Sessions table
            CREATE TABLE IF NOT EXISTS sessions (
                token TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );

            -- Activation codes
            CREATE TABLE IF NOT EXISTS activation_tokens (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                token TEXT UNIQUE NOT NULL,
                user_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                validated_at INTEGER,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );

            -- Books table
            CREATE TABLE IF NOT EXISTS books (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                author_name TEXT NOT NULL,
                isbn TEXT NOT NULL,
                synopsis TEXT,
                cover TEXT,
                archived INTEGER NOT NULL DEFAULT 0,
                shareable INTEGER NOT NULL DEFAULT 0,
                owner_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                created_by TEXT NOT NULL,
                last_modified_by TEXT,
                FOREIGN KEY (owner_id) REFERENCES users(id)
            );

            -- Borrow/return ledger, kept as history
            CREATE TABLE IF NOT EXISTS borrow_transactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                book_id INTEGER NOT NULL,
                user_id TEXT NOT NULL,
                returned INTEGER NOT NULL DEFAULT 0,
                return_approved INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                FOREIGN KEY (book_id) REFERENCES books(id),
                FOREIGN KEY (user_id) REFERENCES users(id)
            );

            -- Feedback table
            CREATE TABLE IF NOT EXISTS feedbacks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                note REAL NOT NULL,
                comment TEXT NOT NULL,
                book_id INTEGER NOT NULL,
                user_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (book_id) REFERENCES books(id),
                FOREIGN KEY (user_id) REFERENCES users(id)
            );

            -- At most one unapproved borrow per (book, borrower)
            CREATE UNIQUE INDEX IF NOT EXISTS idx_borrow_active
                ON borrow_transactions(book_id, user_id) WHERE return_approved = 0;

            -- Indexes
            CREATE INDEX IF NOT EXISTS idx_books_owner ON books(owner_id);
            CREATE INDEX IF NOT EXISTS idx_books_displayable ON books(archived, shareable);
            CREATE INDEX IF NOT EXISTS idx_borrow_user ON borrow_transactions(user_id);
            CREATE INDEX IF NOT EXISTS idx_borrow_book ON borrow_transactions(book_id);
            CREATE INDEX IF NOT EXISTS idx_feedbacks_book ON feedbacks(book_id);
            CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);
            CREATE INDEX IF NOT EXISTS idx_sessions_expires ON sessions(expires_at);
            "#,
        )
        .map_err(|e| AppError::Internal(format!("Failed to initialize schema: {}", e)))?;

        Ok(())
    }

    // ========== USER OPERATIONS ==========

    fn row_to_user(row: &Row<'_>) -> rusqlite::Result<User> {
        Ok(User {
            id: row.get(0)?,
            firstname: row.get(1)?,
            lastname: row.get(2)?,
            email: row.get(3)?,
            password_hash: row.get(4)?,
            date_of_birth: row.get(5)?,
            account_locked: row.get(6)?,
            enabled: row.get(7)?,
            roles: Vec::new(),
            created_at: row.get(8)?,
            last_login: row.get(9)?,
        })
    }

    fn find_user(conn: &Connection, column: &str, value: &str) -> rusqlite::Result<Option<User>> {
        let sql = format!("SELECT {} FROM users WHERE {} = ?1", USER_COLUMNS, column);
        let user = conn
            .query_row(&sql, params![value], Self::row_to_user)
            .optional()?;

        match user {
            Some(mut user) => {
                user.roles = load_roles(conn, &user.id)?;
                Ok(Some(user))
            }
            None => Ok(None),
        }
    }

    /// Create a new user together with its role grants.
    pub fn create_user(&self, user: &User) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO users (id, firstname, lastname, email, password_hash, date_of_birth,
                                account_locked, enabled, created_at, last_login)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                user.id,
                user.firstname,
                user.lastname,
                user.email,
                user.password_hash,
                user.date_of_birth,
                user.account_locked,
                user.enabled,
                user.created_at,
                user.last_login,
            ],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                AppError::Conflict(format!("Email '{}' is already registered", user.email))
            } else {
                AppError::Internal(format!("Failed to create user: {}", e))
            }
        })?;

        for role in &user.roles {
            tx.execute(
                "INSERT OR IGNORE INTO user_roles (user_id, role) VALUES (?1, ?2)",
                params![user.id, role],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Get user by email.
    pub fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let conn = self.conn.lock();
        Self::find_user(&conn, "email", email)
            .map_err(|e| AppError::Internal(format!("Failed to get user: {}", e)))
    }

    /// Get user by ID.
    pub fn get_user_by_id(&self, id: &str) -> Result<Option<User>> {
        let conn = self.conn.lock();
        Self::find_user(&conn, "id", id)
            .map_err(|e| AppError::Internal(format!("Failed to get user: {}", e)))
    }

    /// List all users.
    pub fn list_users(&self) -> Result<Vec<User>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM users ORDER BY email",
                USER_COLUMNS
            ))
            .map_err(|e| AppError::Internal(format!("Failed to prepare query: {}", e)))?;

        let mut users = stmt
            .query_map([], Self::row_to_user)
            .map_err(|e| AppError::Internal(format!("Failed to list users: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Internal(format!("Failed to collect users: {}", e)))?;

        for user in &mut users {
            user.roles = load_roles(&conn, &user.id)?;
        }

        Ok(users)
    }

    /// Update user password.
    pub fn update_user_password(&self, email: &str, password_hash: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "UPDATE users SET password_hash = ?1 WHERE email = ?2",
                params![password_hash, email],
            )
            .map_err(|e| AppError::Internal(format!("Failed to update password: {}", e)))?;
        Ok(rows > 0)
    }

    /// Update user last login.
    pub fn update_user_last_login(&self, user_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE users SET last_login = ?1 WHERE id = ?2",
            params![now_timestamp(), user_id],
        )
        .map_err(|e| AppError::Internal(format!("Failed to update last login: {}", e)))?;
        Ok(())
    }

    /// Enable or disable an account.
    pub fn set_user_enabled(&self, user_id: &str, enabled: bool) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "UPDATE users SET enabled = ?1 WHERE id = ?2",
                params![enabled, user_id],
            )
            .map_err(|e| AppError::Internal(format!("Failed to update user: {}", e)))?;
        Ok(rows > 0)
    }

    /// Lock or unlock an account.
    pub fn set_user_locked(&self, user_id: &str, locked: bool) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "UPDATE users SET account_locked = ?1 WHERE id = ?2",
                params![locked, user_id],
            )
            .map_err(|e| AppError::Internal(format!("Failed to update user: {}", e)))?;
        Ok(rows > 0)
    }

    /// Delete user. Users that own books or appear in the ledger are kept.
    pub fn delete_user(&self, email: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute("DELETE FROM users WHERE email = ?1", params![email])
            .map_err(|e| {
                if is_foreign_key_violation(&e) {
                    AppError::InvalidOperation(format!(
                        "User '{}' owns books or has lending history",
                        email
                    ))
                } else {
                    AppError::Internal(format!("Failed to delete user: {}", e))
                }
            })?;
        Ok(rows > 0)
    }

    // ========== SESSION OPERATIONS ==========

    /// Create session.
    pub fn create_session(&self, session: &Session) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sessions (token, user_id, expires_at) VALUES (?1, ?2, ?3)",
            params![session.token, session.user_id, session.expires_at],
        )
        .map_err(|e| AppError::Internal(format!("Failed to create session: {}", e)))?;
        Ok(())
    }

    /// Get session by token.
    pub fn get_session(&self, token: &str) -> Result<Option<Session>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT token, user_id, expires_at FROM sessions WHERE token = ?1",
            params![token],
            |row| {
                Ok(Session {
                    token: row.get(0)?,
                    user_id: row.get(1)?,
                    expires_at: row.get(2)?,
                })
            },
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get session: {}", e)))
    }

    /// Delete session.
    pub fn delete_session(&self, token: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM sessions WHERE token = ?1", params![token])
            .map_err(|e| AppError::Internal(format!("Failed to delete session: {}", e)))?;
        Ok(())
    }

    /// Cleanup expired sessions.
    pub fn cleanup_expired_sessions(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "DELETE FROM sessions WHERE expires_at < ?1",
                params![now_timestamp()],
            )
            .map_err(|e| AppError::Internal(format!("Failed to cleanup sessions: {}", e)))?;
        Ok(rows)
    }

    // ========== ACTIVATION TOKEN OPERATIONS ==========

    /// Store an activation code, returning its row ID.
    pub fn create_activation_token(&self, token: &ActivationToken) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO activation_tokens (token, user_id, created_at, expires_at, validated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                token.token,
                token.user_id,
                token.created_at,
                token.expires_at,
                token.validated_at,
            ],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                AppError::Conflict("Activation code collision".to_string())
            } else {
                AppError::Internal(format!("Failed to create activation token: {}", e))
            }
        })?;
        Ok(conn.last_insert_rowid())
    }

    /// Look up an activation code.
    pub fn get_activation_token(&self, token: &str) -> Result<Option<ActivationToken>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, token, user_id, created_at, expires_at, validated_at
             FROM activation_tokens WHERE token = ?1",
            params![token],
            |row| {
                Ok(ActivationToken {
                    id: row.get(0)?,
                    token: row.get(1)?,
                    user_id: row.get(2)?,
                    created_at: row.get(3)?,
                    expires_at: row.get(4)?,
                    validated_at: row.get(5)?,
                })
            },
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get activation token: {}", e)))
    }

    /// Stamp an activation code as used.
    pub fn mark_activation_token_validated(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE activation_tokens SET validated_at = ?1 WHERE id = ?2",
            params![now_timestamp(), id],
        )
        .map_err(|e| AppError::Internal(format!("Failed to validate token: {}", e)))?;
        Ok(())
    }

    // ========== BOOK OPERATIONS ==========

    fn row_to_book(row: &Row<'_>) -> rusqlite::Result<Book> {
        Ok(Book {
            id: row.get(0)?,
            title: row.get(1)?,
            author_name: row.get(2)?,
            isbn: row.get(3)?,
            synopsis: row.get(4)?,
            cover: row.get(5)?,
            archived: row.get(6)?,
            shareable: row.get(7)?,
            owner_id: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
            created_by: row.get(11)?,
            last_modified_by: row.get(12)?,
        })
    }

    /// Insert a book, returning its ID. The `id` field is ignored.
    pub fn create_book(&self, book: &Book) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO books
             (title, author_name, isbn, synopsis, cover, archived, shareable, owner_id,
              created_at, updated_at, created_by, last_modified_by)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                book.title,
                book.author_name,
                book.isbn,
                book.synopsis,
                book.cover,
                book.archived,
                book.shareable,
                book.owner_id,
                book.created_at,
                book.updated_at,
                book.created_by,
                book.last_modified_by,
            ],
        )
        .map_err(|e| AppError::Internal(format!("Failed to save book: {}", e)))?;
        Ok(conn.last_insert_rowid())
    }

    /// Update the descriptive fields of a book.
    pub fn update_book(&self, book: &Book) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "UPDATE books SET title = ?1, author_name = ?2, isbn = ?3, synopsis = ?4,
                        shareable = ?5, updated_at = ?6, last_modified_by = ?7
                 WHERE id = ?8",
                params![
                    book.title,
                    book.author_name,
                    book.isbn,
                    book.synopsis,
                    book.shareable,
                    now_timestamp(),
                    book.last_modified_by,
                    book.id,
                ],
            )
            .map_err(|e| AppError::Internal(format!("Failed to update book: {}", e)))?;
        Ok(rows > 0)
    }

    /// Get book by ID.
    pub fn get_book(&self, id: i64) -> Result<Option<Book>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM books WHERE id = ?1", BOOK_COLUMNS),
            params![id],
            Self::row_to_book,
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get book: {}", e)))
    }

    /// Books that are neither archived nor private, newest first.
    pub fn list_displayable_books(&self, request: PageRequest) -> Result<Page<Book>> {
        let conn = self.conn.lock();
        query_page(
            &conn,
            "SELECT COUNT(*) FROM books WHERE archived = 0 AND shareable = 1",
            &format!(
                "SELECT {} FROM books WHERE archived = 0 AND shareable = 1
                 ORDER BY created_at DESC, id DESC",
                BOOK_COLUMNS
            ),
            &[],
            request,
            Self::row_to_book,
        )
        .map_err(|e| AppError::Internal(format!("Failed to list books: {}", e)))
    }

    /// All books of one owner, newest first.
    pub fn list_books_by_owner(&self, owner_id: &str, request: PageRequest) -> Result<Page<Book>> {
        let conn = self.conn.lock();
        query_page(
            &conn,
            "SELECT COUNT(*) FROM books WHERE owner_id = ?1",
            &format!(
                "SELECT {} FROM books WHERE owner_id = ?1 ORDER BY created_at DESC, id DESC",
                BOOK_COLUMNS
            ),
            &[&owner_id],
            request,
            Self::row_to_book,
        )
        .map_err(|e| AppError::Internal(format!("Failed to list books: {}", e)))
    }

    /// Set the shareable flag.
    pub fn set_book_shareable(&self, id: i64, shareable: bool, modified_by: &str) -> Result<bool> {
        self.set_book_flag("shareable", id, shareable, modified_by)
    }

    /// Set the archived flag.
    pub fn set_book_archived(&self, id: i64, archived: bool, modified_by: &str) -> Result<bool> {
        self.set_book_flag("archived", id, archived, modified_by)
    }

    fn set_book_flag(&self, column: &str, id: i64, value: bool, modified_by: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                &format!(
                    "UPDATE books SET {} = ?1, updated_at = ?2, last_modified_by = ?3 WHERE id = ?4",
                    column
                ),
                params![value, now_timestamp(), modified_by, id],
            )
            .map_err(|e| AppError::Internal(format!("Failed to update book: {}", e)))?;
        Ok(rows > 0)
    }

    /// Record the stored cover path.
    pub fn set_book_cover(&self, id: i64, cover: &str, modified_by: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "UPDATE books SET cover = ?1, updated_at = ?2, last_modified_by = ?3 WHERE id = ?4",
                params![cover, now_timestamp(), modified_by, id],
            )
            .map_err(|e| AppError::Internal(format!("Failed to update cover: {}", e)))?;
        Ok(rows > 0)
    }

    // ========== BORROW LEDGER OPERATIONS ==========

    fn row_to_transaction(row: &Row<'_>) -> rusqlite::Result<BorrowTransaction> {
        Ok(BorrowTransaction {
            id: row.get(0)?,
            book_id: row.get(1)?,
            user_id: row.get(2)?,
            returned: row.get(3)?,
            return_approved: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn row_to_borrowed_book(row: &Row<'_>) -> rusqlite::Result<BorrowedBook> {
        Ok(BorrowedBook {
            id: row.get(0)?,
            book_id: row.get(1)?,
            title: row.get(2)?,
            author_name: row.get(3)?,
            isbn: row.get(4)?,
            rate: round_rate(row.get(5)?),
            returned: row.get(6)?,
            return_approved: row.get(7)?,
            borrower_id: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    /// Whether the user holds a borrow of the book that the owner has not approved back.
    pub fn is_already_borrowed_by_user(&self, book_id: i64, user_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM borrow_transactions
                           WHERE book_id = ?1 AND user_id = ?2 AND return_approved = 0)",
            params![book_id, user_id],
            |row| row.get(0),
        )
        .map_err(|e| AppError::Internal(format!("Failed to check borrow: {}", e)))
    }

    /// Insert a new ledger row unless the book is hidden or an active row
    /// exists for (book, user).
    ///
    /// Checks and insert run in one immediate transaction; the partial unique
    /// index rejects anything that slips past the check.
    pub fn create_borrow_transaction(
        &self,
        book_id: i64,
        user_id: &str,
    ) -> Result<BorrowTransaction> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let displayable: Option<bool> = tx
            .query_row(
                "SELECT archived = 0 AND shareable = 1 FROM books WHERE id = ?1",
                params![book_id],
                |row| row.get(0),
            )
            .optional()?;
        match displayable {
            None => {
                return Err(AppError::NotFound(format!(
                    "No book found with ID: {}",
                    book_id
                )));
            }
            Some(false) => {
                return Err(AppError::BookUnavailable(format!(
                    "Book {} is archived or not shareable",
                    book_id
                )));
            }
            Some(true) => {}
        }

        let active: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM borrow_transactions
                           WHERE book_id = ?1 AND user_id = ?2 AND return_approved = 0)",
            params![book_id, user_id],
            |row| row.get(0),
        )?;
        if active {
            return Err(AppError::AlreadyBorrowed(format!(
                "Book {} is already borrowed by this user",
                book_id
            )));
        }

        let now = now_timestamp();
        tx.execute(
            "INSERT INTO borrow_transactions
             (book_id, user_id, returned, return_approved, created_at, updated_at)
             VALUES (?1, ?2, 0, 0, ?3, ?3)",
            params![book_id, user_id, now],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                AppError::AlreadyBorrowed(format!(
                    "Book {} is already borrowed by this user",
                    book_id
                ))
            } else {
                AppError::Internal(format!("Failed to create borrow transaction: {}", e))
            }
        })?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(BorrowTransaction {
            id,
            book_id,
            user_id: user_id.to_string(),
            returned: false,
            return_approved: false,
            created_at: now,
            updated_at: now,
        })
    }

    /// Get ledger row by ID.
    pub fn get_borrow_transaction(&self, id: i64) -> Result<Option<BorrowTransaction>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, book_id, user_id, returned, return_approved, created_at, updated_at
             FROM borrow_transactions WHERE id = ?1",
            params![id],
            Self::row_to_transaction,
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get transaction: {}", e)))
    }

    /// Set `returned`.
    pub fn set_transaction_returned(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "UPDATE borrow_transactions SET returned = 1, updated_at = ?1 WHERE id = ?2",
                params![now_timestamp(), id],
            )
            .map_err(|e| AppError::Internal(format!("Failed to update transaction: {}", e)))?;
        Ok(rows > 0)
    }

    /// Set `return_approved`.
    pub fn set_transaction_return_approved(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "UPDATE borrow_transactions SET return_approved = 1, updated_at = ?1 WHERE id = ?2",
                params![now_timestamp(), id],
            )
            .map_err(|e| AppError::Internal(format!("Failed to update transaction: {}", e)))?;
        Ok(rows > 0)
    }

    /// Ledger rows where the user is the borrower, newest first.
    pub fn list_borrowed_books(
        &self,
        user_id: &str,
        request: PageRequest,
    ) -> Result<Page<BorrowedBook>> {
        let conn = self.conn.lock();
        query_page(
            &conn,
            "SELECT COUNT(*) FROM borrow_transactions WHERE user_id = ?1",
            &format!(
                "{} WHERE t.user_id = ?1 ORDER BY t.created_at DESC, t.id DESC",
                BORROWED_BOOK_SELECT
            ),
            &[&user_id],
            request,
            Self::row_to_borrowed_book,
        )
        .map_err(|e| AppError::Internal(format!("Failed to list borrowed books: {}", e)))
    }

    /// Ledger rows marked returned on books the user owns, newest first.
    pub fn list_returned_books(
        &self,
        owner_id: &str,
        request: PageRequest,
    ) -> Result<Page<BorrowedBook>> {
        let conn = self.conn.lock();
        query_page(
            &conn,
            "SELECT COUNT(*) FROM borrow_transactions t JOIN books b ON b.id = t.book_id
             WHERE b.owner_id = ?1 AND t.returned = 1",
            &format!(
                "{} WHERE b.owner_id = ?1 AND t.returned = 1
                 ORDER BY t.created_at DESC, t.id DESC",
                BORROWED_BOOK_SELECT
            ),
            &[&owner_id],
            request,
            Self::row_to_borrowed_book,
        )
        .map_err(|e| AppError::Internal(format!("Failed to list returned books: {}", e)))
    }

    // ========== FEEDBACK OPERATIONS ==========

    fn row_to_feedback(row: &Row<'_>) -> rusqlite::Result<Feedback> {
        Ok(Feedback {
            id: row.get(0)?,
            note: row.get(1)?,
            comment: row.get(2)?,
            book_id: row.get(3)?,
            user_id: row.get(4)?,
            created_at: row.get(5)?,
        })
    }

    /// Insert feedback, returning its ID.
    pub fn create_feedback(&self, feedback: &Feedback) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO feedbacks (note, comment, book_id, user_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                feedback.note,
                feedback.comment,
                feedback.book_id,
                feedback.user_id,
                feedback.created_at,
            ],
        )
        .map_err(|e| AppError::Internal(format!("Failed to save feedback: {}", e)))?;
        Ok(conn.last_insert_rowid())
    }

    /// Feedback on one book, newest first.
    pub fn list_feedbacks_by_book(
        &self,
        book_id: i64,
        request: PageRequest,
    ) -> Result<Page<Feedback>> {
        let conn = self.conn.lock();
        query_page(
            &conn,
            "SELECT COUNT(*) FROM feedbacks WHERE book_id = ?1",
            "SELECT id, note, comment, book_id, user_id, created_at FROM feedbacks
             WHERE book_id = ?1 ORDER BY created_at DESC, id DESC",
            &[&book_id],
            request,
            Self::row_to_feedback,
        )
        .map_err(|e| AppError::Internal(format!("Failed to list feedbacks: {}", e)))
    }

    /// Average note of a book, rounded to one decimal; 0.0 without feedback.
    pub fn book_rate(&self, book_id: i64) -> Result<f64> {
        let conn = self.conn.lock();
        let avg: Option<f64> = conn
            .query_row(
                "SELECT AVG(note) FROM feedbacks WHERE book_id = ?1",
                params![book_id],
                |row| row.get(0),
            )
            .map_err(|e| AppError::Internal(format!("Failed to compute rate: {}", e)))?;
        Ok(avg.map(round_rate).unwrap_or(0.0))
    }

    // ========== STATS ==========

    fn count(&self, sql: &str) -> Result<u64> {
        let conn = self.conn.lock();
        let n: i64 = conn
            .query_row(sql, [], |row| row.get(0))
            .map_err(|e| AppError::Internal(format!("Failed to count rows: {}", e)))?;
        Ok(n.max(0) as u64)
    }

    /// Number of accounts.
    pub fn count_users(&self) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM users")
    }

    /// Number of books.
    pub fn count_books(&self) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM books")
    }

    /// Number of displayable books.
    pub fn count_displayable_books(&self) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM books WHERE archived = 0 AND shareable = 1")
    }

    /// Number of borrows awaiting return approval.
    pub fn count_active_borrows(&self) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM borrow_transactions WHERE return_approved = 0")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_borrow_index_rejects_second_open_row() {
        let db = Database::open_memory().unwrap();
        let conn = db.conn.lock();
        conn.execute_batch(
            "INSERT INTO users (id, email, password_hash, created_at) VALUES ('o', 'o@x.io', 'h', 0);
             INSERT INTO users (id, email, password_hash, created_at) VALUES ('b', 'b@x.io', 'h', 0);
             INSERT INTO books (title, author_name, isbn, owner_id, created_at, updated_at, created_by)
             VALUES ('t', 'a', 'i', 'o', 0, 0, 'o');
             INSERT INTO borrow_transactions (book_id, user_id, created_at, updated_at)
             VALUES (1, 'b', 0, 0);",
        )
        .unwrap();

        let err = conn
            .execute(
                "INSERT INTO borrow_transactions (book_id, user_id, created_at, updated_at)
                 VALUES (1, 'b', 1, 1)",
                [],
            )
            .unwrap_err();
        assert!(is_unique_violation(&err));

        // Approved rows drop out of the index.
        conn.execute("UPDATE borrow_transactions SET return_approved = 1", [])
            .unwrap();
        conn.execute(
            "INSERT INTO borrow_transactions (book_id, user_id, created_at, updated_at)
             VALUES (1, 'b', 2, 2)",
            [],
        )
        .unwrap();
    }

    #[test]
    fn borrow_rechecks_book_state_inside_transaction() {
        let db = Database::open_memory().unwrap();
        {
            let conn = db.conn.lock();
            conn.execute_batch(
                "INSERT INTO users (id, email, password_hash, created_at) VALUES ('o', 'o@x.io', 'h', 0);
                 INSERT INTO users (id, email, password_hash, created_at) VALUES ('b', 'b@x.io', 'h', 0);
                 INSERT INTO books (title, author_name, isbn, shareable, archived, owner_id,
                                    created_at, updated_at, created_by)
                 VALUES ('t', 'a', 'i', 1, 1, 'o', 0, 0, 'o');",
            )
            .unwrap();
        }

        let err = db.create_borrow_transaction(1, "b").unwrap_err();
        assert!(matches!(err, AppError::BookUnavailable(_)));
        let err = db.create_borrow_transaction(99, "b").unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert_eq!(db.count_active_borrows().unwrap(), 0);

        db.set_book_archived(1, false, "o").unwrap();
        assert!(db.create_borrow_transaction(1, "b").is_ok());
    }
}
