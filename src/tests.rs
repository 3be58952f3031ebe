use crate::auth::{AuthService, Registration};
use crate::config::{AuthConfig, Config, MailConfig, StorageConfig};
use crate::db::{ActivationToken, Book, Database, PageRequest, ROLE_USER, User, now_timestamp};
use crate::error::{AppError, ErrorKind};
use crate::mail::{ActivationMail, Mailer};
use crate::server::{self, AppState};
use crate::service::{BookRequest, BookService, BorrowService, FeedbackRequest, FeedbackService};
use crate::storage::FileStorage;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use parking_lot::Mutex;
use std::sync::Arc;
use tower::ServiceExt;

fn test_db() -> Database {
    Database::open_memory().unwrap()
}

fn create_user(db: &Database, id: &str, email: &str) -> User {
    let user = User {
        id: id.to_string(),
        firstname: id.to_string(),
        lastname: "Reader".to_string(),
        email: email.to_string(),
        password_hash: "hash".to_string(),
        date_of_birth: None,
        account_locked: false,
        enabled: true,
        roles: vec![ROLE_USER.to_string()],
        created_at: now_timestamp(),
        last_login: None,
    };
    db.create_user(&user).unwrap();
    user
}

fn create_book(db: &Database, owner_id: &str, title: &str, shareable: bool) -> i64 {
    let now = now_timestamp();
    let book = Book {
        id: 0,
        title: title.to_string(),
        author_name: "Author".to_string(),
        isbn: "978-0000000000".to_string(),
        synopsis: None,
        cover: None,
        archived: false,
        shareable,
        owner_id: owner_id.to_string(),
        created_at: now,
        updated_at: now,
        created_by: owner_id.to_string(),
        last_modified_by: None,
    };
    db.create_book(&book).unwrap()
}

/// Owner "alice", borrower "bob", one shareable book owned by alice.
fn setup_ledger(db: &Database) -> i64 {
    create_user(db, "alice", "alice@example.com");
    create_user(db, "bob", "bob@example.com");
    create_book(db, "alice", "Dune", true)
}

#[derive(Default)]
struct RecordingMailer {
    sent: Mutex<Vec<ActivationMail>>,
}

impl RecordingMailer {
    fn last_code(&self) -> String {
        self.sent.lock().last().map(|m| m.code.clone()).unwrap()
    }
}

impl Mailer for RecordingMailer {
    fn send_activation(&self, mail: &ActivationMail) -> crate::error::Result<()> {
        self.sent.lock().push(mail.clone());
        Ok(())
    }
}

struct FailingMailer;

impl Mailer for FailingMailer {
    fn send_activation(&self, _mail: &ActivationMail) -> crate::error::Result<()> {
        Err(AppError::Internal("relay unreachable".to_string()))
    }
}

fn auth_service(db: &Database, mailer: Arc<RecordingMailer>) -> AuthService {
    AuthService::new(
        db.clone(),
        &AuthConfig::default(),
        &MailConfig::default(),
        mailer,
    )
}

fn registration(email: &str) -> Registration {
    Registration {
        firstname: "John".to_string(),
        lastname: "Doe".to_string(),
        email: email.to_string(),
        password: "password123".to_string(),
    }
}

// ============================================================================
// DATABASE
// ============================================================================

#[test]
fn db_create_and_get_user() {
    let db = test_db();
    create_user(&db, "alice", "alice@example.com");

    let by_email = db.get_user_by_email("alice@example.com").unwrap().unwrap();
    assert_eq!(by_email.id, "alice");
    assert_eq!(by_email.roles, vec![ROLE_USER.to_string()]);
    assert!(by_email.enabled);

    let by_id = db.get_user_by_id("alice").unwrap().unwrap();
    assert_eq!(by_id.email, "alice@example.com");
    assert_eq!(by_id.full_name(), "alice Reader");
}

#[test]
fn db_duplicate_email_is_conflict() {
    let db = test_db();
    create_user(&db, "alice", "alice@example.com");

    let mut dup = db.get_user_by_email("alice@example.com").unwrap().unwrap();
    dup.id = "other".to_string();
    let err = db.create_user(&dup).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[test]
fn db_delete_user_with_books_is_refused() {
    let db = test_db();
    create_user(&db, "alice", "alice@example.com");
    create_user(&db, "carol", "carol@example.com");
    create_book(&db, "alice", "Dune", true);

    let err = db.delete_user("alice@example.com").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidOperation);

    assert!(db.delete_user("carol@example.com").unwrap());
    assert!(!db.delete_user("nobody@example.com").unwrap());
}

#[test]
fn db_book_round_trip_and_flags() {
    let db = test_db();
    create_user(&db, "alice", "alice@example.com");
    let id = create_book(&db, "alice", "Dune", false);

    let book = db.get_book(id).unwrap().unwrap();
    assert_eq!(book.title, "Dune");
    assert!(!book.is_displayable());

    db.set_book_shareable(id, true, "alice").unwrap();
    let book = db.get_book(id).unwrap().unwrap();
    assert!(book.is_displayable());
    assert_eq!(book.last_modified_by.as_deref(), Some("alice"));

    db.set_book_archived(id, true, "alice").unwrap();
    assert!(!db.get_book(id).unwrap().unwrap().is_displayable());
    assert!(db.get_book(id + 100).unwrap().is_none());
}

#[test]
fn db_listings_are_newest_first_and_paged() {
    let db = test_db();
    create_user(&db, "alice", "alice@example.com");
    let ids: Vec<i64> = (0..5)
        .map(|i| create_book(&db, "alice", &format!("Book {}", i), true))
        .collect();
    create_book(&db, "alice", "Private", false);

    let page = db.list_displayable_books(PageRequest::new(0, 2)).unwrap();
    assert_eq!(page.total_elements, 5);
    assert_eq!(page.total_pages, 3);
    assert!(page.first);
    assert!(!page.last);
    assert_eq!(
        page.content.iter().map(|b| b.id).collect::<Vec<_>>(),
        vec![ids[4], ids[3]]
    );

    let last = db.list_displayable_books(PageRequest::new(2, 2)).unwrap();
    assert_eq!(last.content.len(), 1);
    assert_eq!(last.content[0].id, ids[0]);
    assert!(last.last);

    let owned = db.list_books_by_owner("alice", PageRequest::default()).unwrap();
    assert_eq!(owned.total_elements, 6);
}

#[test]
fn db_page_request_clamps_size() {
    assert_eq!(PageRequest::new(0, 0).size, 1);
    assert_eq!(PageRequest::new(3, 1000).size, PageRequest::MAX_SIZE);
    assert_eq!(PageRequest::new(3, 10).offset(), 30);
    assert_eq!(PageRequest::default(), PageRequest::new(0, 10));
}

#[test]
fn db_empty_page() {
    let db = test_db();
    let page = db.list_displayable_books(PageRequest::default()).unwrap();
    assert!(page.content.is_empty());
    assert_eq!(page.total_elements, 0);
    assert_eq!(page.total_pages, 0);
    assert!(page.first);
    assert!(page.last);
}

#[test]
fn db_sessions_expire() {
    let db = test_db();
    create_user(&db, "alice", "alice@example.com");

    db.create_session(&crate::db::Session {
        token: "old".to_string(),
        user_id: "alice".to_string(),
        expires_at: now_timestamp() - 10,
    })
    .unwrap();
    db.create_session(&crate::db::Session {
        token: "fresh".to_string(),
        user_id: "alice".to_string(),
        expires_at: now_timestamp() + 3600,
    })
    .unwrap();

    assert_eq!(db.cleanup_expired_sessions().unwrap(), 1);
    assert!(db.get_session("old").unwrap().is_none());
    assert!(db.get_session("fresh").unwrap().is_some());
}

#[test]
fn db_counts() {
    let db = test_db();
    let book = setup_ledger(&db);
    create_book(&db, "alice", "Hidden", false);
    db.create_borrow_transaction(book, "bob").unwrap();

    assert_eq!(db.count_users().unwrap(), 2);
    assert_eq!(db.count_books().unwrap(), 2);
    assert_eq!(db.count_displayable_books().unwrap(), 1);
    assert_eq!(db.count_active_borrows().unwrap(), 1);
}

// ============================================================================
// LEDGER
// ============================================================================

#[test]
fn ledger_borrow_creates_active_transaction() {
    let db = test_db();
    let book = setup_ledger(&db);
    let ledger = BorrowService::new(db.clone());

    let tx_id = ledger.borrow(book, "bob").unwrap();
    let tx = db.get_borrow_transaction(tx_id).unwrap().unwrap();

    assert_eq!(tx.book_id, book);
    assert_eq!(tx.user_id, "bob");
    assert!(!tx.returned);
    assert!(!tx.return_approved);
    assert!(ledger.is_already_borrowed_by_user(book, "bob").unwrap());
    assert!(!ledger.is_already_borrowed_by_user(book, "alice").unwrap());
}

#[test]
fn ledger_unknown_book_is_not_found() {
    let db = test_db();
    setup_ledger(&db);
    let ledger = BorrowService::new(db);

    let err = ledger.borrow(9999, "bob").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn ledger_own_book_is_invalid() {
    let db = test_db();
    let book = setup_ledger(&db);
    let ledger = BorrowService::new(db.clone());

    let err = ledger.borrow(book, "alice").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidOperation);
    assert_eq!(db.count_active_borrows().unwrap(), 0);
}

#[test]
fn ledger_unavailable_books_are_rejected() {
    let db = test_db();
    let book = setup_ledger(&db);
    let private = create_book(&db, "alice", "Private", false);
    let ledger = BorrowService::new(db.clone());

    let err = ledger.borrow(private, "bob").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BookUnavailable);

    db.set_book_archived(book, true, "alice").unwrap();
    let err = ledger.borrow(book, "bob").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BookUnavailable);

    // Availability is checked before ownership.
    let err = ledger.borrow(book, "alice").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BookUnavailable);
}

#[test]
fn ledger_double_borrow_is_rejected() {
    let db = test_db();
    let book = setup_ledger(&db);
    let ledger = BorrowService::new(db.clone());

    let tx_id = ledger.borrow(book, "bob").unwrap();
    let err = ledger.borrow(book, "bob").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyBorrowed);

    // Claiming the return does not release the book.
    ledger.mark_returned(tx_id, "bob").unwrap();
    let err = ledger.borrow(book, "bob").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyBorrowed);
    assert!(ledger.is_already_borrowed_by_user(book, "bob").unwrap());
}

#[test]
fn ledger_other_users_may_borrow_concurrently() {
    let db = test_db();
    let book = setup_ledger(&db);
    create_user(&db, "carol", "carol@example.com");
    let ledger = BorrowService::new(db.clone());

    let t1 = ledger.borrow(book, "bob").unwrap();
    let t2 = ledger.borrow(book, "carol").unwrap();
    assert_ne!(t1, t2);
    assert_eq!(db.count_active_borrows().unwrap(), 2);
}

#[test]
fn ledger_mark_returned_is_idempotent() {
    let db = test_db();
    let book = setup_ledger(&db);
    let ledger = BorrowService::new(db.clone());

    let tx_id = ledger.borrow(book, "bob").unwrap();
    assert_eq!(ledger.mark_returned(tx_id, "bob").unwrap(), tx_id);
    assert_eq!(ledger.mark_returned(tx_id, "bob").unwrap(), tx_id);

    let tx = db.get_borrow_transaction(tx_id).unwrap().unwrap();
    assert!(tx.returned);
    assert!(!tx.return_approved);
}

#[test]
fn ledger_only_borrower_marks_returned() {
    let db = test_db();
    let book = setup_ledger(&db);
    let ledger = BorrowService::new(db.clone());

    let tx_id = ledger.borrow(book, "bob").unwrap();
    let err = ledger.mark_returned(tx_id, "alice").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidOperation);

    let err = ledger.mark_returned(tx_id + 100, "bob").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn ledger_approve_requires_return_claim() {
    let db = test_db();
    let book = setup_ledger(&db);
    let ledger = BorrowService::new(db.clone());

    let tx_id = ledger.borrow(book, "bob").unwrap();
    let err = ledger.approve_return(tx_id, "alice").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidOperation);

    let tx = db.get_borrow_transaction(tx_id).unwrap().unwrap();
    assert!(!tx.return_approved);
}

#[test]
fn ledger_only_owner_approves() {
    let db = test_db();
    let book = setup_ledger(&db);
    let ledger = BorrowService::new(db.clone());

    let tx_id = ledger.borrow(book, "bob").unwrap();
    ledger.mark_returned(tx_id, "bob").unwrap();

    let err = ledger.approve_return(tx_id, "bob").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidOperation);
    assert_eq!(ledger.approve_return(tx_id, "alice").unwrap(), tx_id);
}

#[test]
fn ledger_full_cycle_allows_reborrow() {
    let db = test_db();
    let book = setup_ledger(&db);
    let ledger = BorrowService::new(db.clone());

    let t1 = ledger.borrow(book, "bob").unwrap();
    ledger.mark_returned(t1, "bob").unwrap();
    ledger.approve_return(t1, "alice").unwrap();
    assert!(!ledger.is_already_borrowed_by_user(book, "bob").unwrap());

    let t2 = ledger.borrow(book, "bob").unwrap();
    assert_ne!(t1, t2);
    assert!(ledger.is_already_borrowed_by_user(book, "bob").unwrap());

    let history = ledger
        .find_all_borrowed_books("bob", PageRequest::default())
        .unwrap();
    assert_eq!(history.total_elements, 2);
    assert_eq!(history.content[0].id, t2);
    assert_eq!(history.content[1].id, t1);
    assert!(history.content[1].return_approved);
    assert!(!history.content[0].returned);
}

#[test]
fn ledger_returned_listing_shows_owner_claims() {
    let db = test_db();
    let book = setup_ledger(&db);
    let other = create_book(&db, "alice", "Emma", true);
    let ledger = BorrowService::new(db.clone());

    let t1 = ledger.borrow(book, "bob").unwrap();
    ledger.borrow(other, "bob").unwrap();
    ledger.mark_returned(t1, "bob").unwrap();

    let returned = ledger
        .find_all_returned_books("alice", PageRequest::default())
        .unwrap();
    assert_eq!(returned.total_elements, 1);
    assert_eq!(returned.content[0].id, t1);
    assert_eq!(returned.content[0].borrower_id, "bob");
    assert_eq!(returned.content[0].title, "Dune");

    let none = ledger
        .find_all_returned_books("bob", PageRequest::default())
        .unwrap();
    assert_eq!(none.total_elements, 0);
}

#[test]
fn ledger_borrowed_listing_carries_rate() {
    let db = test_db();
    let book = setup_ledger(&db);
    create_user(&db, "carol", "carol@example.com");
    let feedback = FeedbackService::new(db.clone());
    for (user, note) in [("bob", 4.0), ("carol", 3.5)] {
        feedback
            .save(
                &FeedbackRequest {
                    note,
                    comment: "Good".to_string(),
                    book_id: book,
                },
                user,
            )
            .unwrap();
    }

    let ledger = BorrowService::new(db);
    ledger.borrow(book, "bob").unwrap();
    let page = ledger
        .find_all_borrowed_books("bob", PageRequest::default())
        .unwrap();
    assert_eq!(page.content[0].rate, 3.8);
}

// ============================================================================
// BOOKS
// ============================================================================

fn book_service(db: &Database, dir: &std::path::Path) -> BookService {
    BookService::new(
        db.clone(),
        Arc::new(FileStorage::new(&StorageConfig {
            covers_dir: dir.to_path_buf(),
            max_cover_bytes: 1024 * 1024,
        })),
    )
}

fn book_request(title: &str) -> BookRequest {
    BookRequest {
        title: title.to_string(),
        author_name: "Frank Herbert".to_string(),
        isbn: "9780441013593".to_string(),
        synopsis: Some("Spice".to_string()),
        shareable: true,
    }
}

#[test]
fn books_save_and_find() {
    let db = test_db();
    create_user(&db, "alice", "alice@example.com");
    let dir = tempfile::tempdir().unwrap();
    let books = book_service(&db, dir.path());

    let id = books.save(&book_request("Dune"), "alice").unwrap();
    let book = books.find_by_id(id).unwrap();

    assert_eq!(book.title, "Dune");
    assert_eq!(book.owner, "alice Reader");
    assert_eq!(book.rate, 0.0);
    assert!(book.cover.is_none());
    assert!(book.shareable);
    assert!(!book.archived);
}

#[test]
fn books_validation() {
    let db = test_db();
    create_user(&db, "alice", "alice@example.com");
    let dir = tempfile::tempdir().unwrap();
    let books = book_service(&db, dir.path());

    let mut req = book_request("  ");
    let err = books.save(&req, "alice").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    req.title = "Dune".to_string();
    req.isbn = String::new();
    let err = books.save(&req, "alice").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[test]
fn books_toggles_are_owner_only() {
    let db = test_db();
    let book = setup_ledger(&db);
    let dir = tempfile::tempdir().unwrap();
    let books = book_service(&db, dir.path());

    let err = books.update_shareable_status(book, "bob").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidOperation);
    let err = books.update_archived_status(book, "bob").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidOperation);

    books.update_archived_status(book, "alice").unwrap();
    assert!(books.find_by_id(book).unwrap().archived);
    books.update_archived_status(book, "alice").unwrap();
    assert!(!books.find_by_id(book).unwrap().archived);

    books.update_shareable_status(book, "alice").unwrap();
    assert!(!books.find_by_id(book).unwrap().shareable);
    assert_eq!(
        books.find_all_books(PageRequest::default()).unwrap().total_elements,
        0
    );
}

#[test]
fn books_update_is_owner_only() {
    let db = test_db();
    let book = setup_ledger(&db);
    let dir = tempfile::tempdir().unwrap();
    let books = book_service(&db, dir.path());

    let err = books.update(book, &book_request("Stolen"), "bob").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidOperation);

    books.update(book, &book_request("Dune Messiah"), "alice").unwrap();
    assert_eq!(books.find_by_id(book).unwrap().title, "Dune Messiah");
}

#[test]
fn books_cover_upload() {
    let db = test_db();
    let book = setup_ledger(&db);
    let dir = tempfile::tempdir().unwrap();
    let books = book_service(&db, dir.path());

    let mut png = Vec::new();
    image::DynamicImage::ImageRgba8(image::RgbaImage::new(2, 3))
        .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
        .unwrap();

    let err = books.upload_cover(book, "bob", &png).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidOperation);

    books.upload_cover(book, "alice", &png).unwrap();
    let path = books.cover_path(book, "bob").unwrap().unwrap();
    assert!(path.starts_with(dir.path()));
    assert!(books.find_by_id(book).unwrap().cover.is_some());
}

#[test]
fn books_hidden_cover_is_owner_only() {
    let db = test_db();
    let book = setup_ledger(&db);
    let dir = tempfile::tempdir().unwrap();
    let books = book_service(&db, dir.path());

    books.update_archived_status(book, "alice").unwrap();

    let err = books.cover_path(book, "bob").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BookUnavailable);
    assert!(books.cover_path(book, "alice").unwrap().is_none());

    let err = books.cover_path(book + 100, "alice").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

// ============================================================================
// FEEDBACK
// ============================================================================

#[test]
fn feedback_save_and_list() {
    let db = test_db();
    let book = setup_ledger(&db);
    create_user(&db, "carol", "carol@example.com");
    let feedback = FeedbackService::new(db.clone());

    let request = |note: f64| FeedbackRequest {
        note,
        comment: "Loved it".to_string(),
        book_id: book,
    };
    feedback.save(&request(5.0), "bob").unwrap();
    feedback.save(&request(4.0), "carol").unwrap();
    // Repeat feedback is accepted.
    feedback.save(&request(3.0), "bob").unwrap();

    let page = feedback
        .find_all_feedbacks_by_book(book, "bob", PageRequest::default())
        .unwrap();
    assert_eq!(page.total_elements, 3);
    assert_eq!(
        page.content.iter().map(|f| f.own_feedback).collect::<Vec<_>>(),
        vec![true, false, true]
    );
    assert_eq!(feedback.rate(book).unwrap(), 4.0);
}

#[test]
fn feedback_rules() {
    let db = test_db();
    let book = setup_ledger(&db);
    let private = create_book(&db, "alice", "Private", false);
    let feedback = FeedbackService::new(db.clone());

    let request = |book_id: i64, note: f64| FeedbackRequest {
        note,
        comment: "Meh".to_string(),
        book_id,
    };

    let err = feedback.save(&request(book, 6.0), "bob").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    let err = feedback.save(&request(9999, 3.0), "bob").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let err = feedback.save(&request(private, 3.0), "bob").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BookUnavailable);
    let err = feedback.save(&request(book, 3.0), "alice").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidOperation);

    let err = feedback
        .find_all_feedbacks_by_book(9999, "bob", PageRequest::default())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

// ============================================================================
// AUTH
// ============================================================================

#[test]
fn auth_register_and_activate() {
    let db = test_db();
    let mailer = Arc::new(RecordingMailer::default());
    let auth = auth_service(&db, mailer.clone());

    let user = auth.register(&registration("john@example.com")).unwrap();
    assert!(!user.enabled);
    assert_eq!(mailer.sent.lock().len(), 1);

    let err = auth.login("john@example.com", "password123").unwrap_err();
    assert!(matches!(err, AppError::AccountDisabled));

    let activated = auth.activate(&mailer.last_code()).unwrap();
    assert!(activated.enabled);

    let (logged_in, token) = auth.login("john@example.com", "password123").unwrap();
    assert_eq!(logged_in.id, user.id);
    assert_eq!(auth.validate_token(&token).unwrap().unwrap().id, user.id);

    auth.logout(&token).unwrap();
    assert!(auth.validate_token(&token).unwrap().is_none());
}

#[test]
fn auth_activation_code_is_single_use() {
    let db = test_db();
    let mailer = Arc::new(RecordingMailer::default());
    let auth = auth_service(&db, mailer.clone());

    auth.register(&registration("john@example.com")).unwrap();
    let code = mailer.last_code();
    auth.activate(&code).unwrap();

    let err = auth.activate(&code).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadCredentials);
    let err = auth.activate("000000x").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadCredentials);
}

#[test]
fn auth_expired_code_is_resent() {
    let db = test_db();
    let mailer = Arc::new(RecordingMailer::default());
    let auth = auth_service(&db, mailer.clone());

    let user = auth.register(&registration("john@example.com")).unwrap();
    let now = now_timestamp();
    db.create_activation_token(&ActivationToken {
        id: 0,
        token: "expired-code".to_string(),
        user_id: user.id.clone(),
        created_at: now - 3600,
        expires_at: now - 60,
        validated_at: None,
    })
    .unwrap();

    let err = auth.activate("expired-code").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadCredentials);
    assert_eq!(mailer.sent.lock().len(), 2);
    assert!(!db.get_user_by_id(&user.id).unwrap().unwrap().enabled);

    auth.activate(&mailer.last_code()).unwrap();
    assert!(db.get_user_by_id(&user.id).unwrap().unwrap().enabled);
}

#[test]
fn auth_register_rolls_back_when_mail_fails() {
    let db = test_db();
    let failing = AuthService::new(
        db.clone(),
        &AuthConfig::default(),
        &MailConfig::default(),
        Arc::new(FailingMailer),
    );

    let err = failing.register(&registration("john@example.com")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);
    assert!(db.get_user_by_email("john@example.com").unwrap().is_none());

    let mailer = Arc::new(RecordingMailer::default());
    let auth = auth_service(&db, mailer.clone());
    auth.register(&registration("john@example.com")).unwrap();
    auth.activate(&mailer.last_code()).unwrap();
}

#[test]
fn auth_register_validation() {
    let db = test_db();
    let auth = auth_service(&db, Arc::new(RecordingMailer::default()));

    let mut reg = registration("not-an-email");
    assert_eq!(
        auth.register(&reg).unwrap_err().kind(),
        ErrorKind::Validation
    );

    reg.email = "john@example.com".to_string();
    reg.password = "short".to_string();
    assert_eq!(
        auth.register(&reg).unwrap_err().kind(),
        ErrorKind::Validation
    );

    auth.register(&registration("john@example.com")).unwrap();
    assert_eq!(
        auth.register(&registration("john@example.com"))
            .unwrap_err()
            .kind(),
        ErrorKind::Conflict
    );
}

#[test]
fn auth_registration_disabled() {
    let db = test_db();
    let config = AuthConfig {
        registration: "disabled".to_string(),
        ..AuthConfig::default()
    };
    let auth = AuthService::new(
        db,
        &config,
        &MailConfig::default(),
        Arc::new(RecordingMailer::default()),
    );

    let err = auth.register(&registration("john@example.com")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidOperation);
}

#[test]
fn auth_login_failures() {
    let db = test_db();
    let auth = auth_service(&db, Arc::new(RecordingMailer::default()));

    auth.create_user("jane@example.com", "Jane", "Doe", "password123", "user")
        .unwrap();

    let err = auth.login("jane@example.com", "wrong-password").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadCredentials);
    let err = auth.login("ghost@example.com", "password123").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadCredentials);

    let (_, token) = auth.login("jane@example.com", "password123").unwrap();
    assert!(auth.set_account_locked("jane@example.com", true).unwrap());

    let err = auth.login("jane@example.com", "password123").unwrap_err();
    assert!(matches!(err, AppError::AccountLocked));
    assert!(auth.validate_token(&token).unwrap().is_none());

    assert!(auth.set_account_locked("jane@example.com", false).unwrap());
    assert!(auth.validate_token(&token).unwrap().is_some());
    assert!(!auth.set_account_locked("ghost@example.com", true).unwrap());
}

#[test]
fn auth_admin_role_and_password_change() {
    let db = test_db();
    let auth = auth_service(&db, Arc::new(RecordingMailer::default()));

    let admin = auth
        .create_user("root@example.com", "Root", "", "password123", "admin")
        .unwrap();
    assert_eq!(admin.roles, vec!["user".to_string(), "admin".to_string()]);
    assert!(
        auth.create_user("x@example.com", "X", "", "password123", "superuser")
            .is_err()
    );

    assert!(auth.change_password("root@example.com", "new-password").unwrap());
    assert!(auth.login("root@example.com", "password123").is_err());
    assert!(auth.login("root@example.com", "new-password").is_ok());
}

#[test]
fn auth_force_activate() {
    let db = test_db();
    let auth = auth_service(&db, Arc::new(RecordingMailer::default()));

    auth.register(&registration("john@example.com")).unwrap();
    assert!(auth.force_activate("john@example.com").unwrap());
    assert!(!auth.force_activate("ghost@example.com").unwrap());
    assert!(auth.login("john@example.com", "password123").is_ok());
}

// ============================================================================
// CONFIG
// ============================================================================

#[test]
fn config_cli_lock_commands() {
    use crate::config::{Cli, Command, UserCommand};
    use clap::Parser;

    let cli = Cli::try_parse_from(["book-network", "user", "lock", "jane@example.com"]).unwrap();
    assert!(matches!(
        cli.command,
        Some(Command::User {
            action: UserCommand::Lock { ref email }
        }) if email == "jane@example.com"
    ));

    let cli = Cli::try_parse_from(["book-network", "user", "unlock", "jane@example.com"]).unwrap();
    assert!(matches!(
        cli.command,
        Some(Command::User {
            action: UserCommand::Unlock { .. }
        })
    ));
}

#[test]
fn config_defaults() {
    let config = Config::default();
    assert_eq!(config.server.bind.port(), 8088);
    assert!(config.auth.registration_enabled());
    assert_eq!(config.auth.session_days, 1);
    assert_eq!(config.auth.activation_minutes, 15);
    assert_eq!(config.storage.max_cover_bytes, 5 * 1024 * 1024);
}

#[test]
fn config_generated_default_parses() {
    let config: Config = toml::from_str(&Config::generate_default()).unwrap();
    assert_eq!(config.server.title, "Book Social Network");
    assert_eq!(config.auth.cleanup_interval_seconds, 3600);
}

#[test]
fn config_partial_file() {
    let config: Config = toml::from_str(
        r#"
[server]
bind = "127.0.0.1:9000"

[auth]
registration = "disabled"
"#,
    )
    .unwrap();

    assert_eq!(config.server.bind.port(), 9000);
    assert!(!config.auth.registration_enabled());
    assert_eq!(config.auth.session_days, 1);
}

// ============================================================================
// HTTP
// ============================================================================

struct TestApp {
    router: axum::Router,
    state: AppState,
    _dir: tempfile::TempDir,
}

impl TestApp {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.covers_dir = dir.path().to_path_buf();

        let db = test_db();
        let auth = AuthService::new(
            db.clone(),
            &config.auth,
            &config.mail,
            Arc::new(RecordingMailer::default()),
        );
        let state = AppState::new_with_db(config, db, auth);

        Self {
            router: server::create_router(state.clone()),
            state,
            _dir: dir,
        }
    }

    fn login(&self, email: &str) -> String {
        self.state
            .auth
            .create_user(email, "Test", "User", "password123", "user")
            .unwrap();
        self.state.auth.login(email, "password123").unwrap().1
    }

    async fn request(
        &self,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        self.send(method, uri, token, body.map(|json| json.to_string()))
            .await
    }

    async fn send(
        &self,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<String>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        let body = match body {
            Some(text) => {
                builder = builder.header("content-type", "application/json");
                Body::from(text)
            }
            None => Body::empty(),
        };

        let response = self
            .router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }
}

#[tokio::test]
async fn http_requires_token() {
    let app = TestApp::new();

    let (status, body) = app.request("GET", "/api/books", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["kind"], "UNAUTHENTICATED");
    assert_eq!(body["code"], 401);

    let (status, body) = app.request("GET", "/api/books", Some("bogus"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["kind"], "UNAUTHENTICATED");

    let (status, _) = app.request("GET", "/api/books/1/cover", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn http_wrong_password_is_bad_credentials() {
    let app = TestApp::new();
    app.login("reader@example.com");

    let (status, body) = app
        .request(
            "POST",
            "/api/auth/login",
            None,
            Some(serde_json::json!({
                "email": "reader@example.com",
                "password": "not-the-password",
            })),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["kind"], "BAD_CREDENTIALS");
    assert_eq!(body["code"], 304);
}

#[tokio::test]
async fn http_malformed_requests_get_error_body() {
    let app = TestApp::new();
    let token = app.login("reader@example.com");

    let (status, body) = app
        .send("POST", "/api/books", Some(&token), Some("{not json".to_string()))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "VALIDATION");
    assert_eq!(body["code"], 422);

    let (status, body) = app
        .request(
            "POST",
            "/api/books",
            Some(&token),
            Some(serde_json::json!({ "title": "x" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "VALIDATION");
    assert!(body["error"].as_str().unwrap().contains("author_name"));

    let (status, body) = app
        .request("POST", "/api/books/borrow/abc", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "VALIDATION");

    let (status, body) = app
        .request("GET", "/api/books?page=minus-one", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "VALIDATION");
}

#[tokio::test]
async fn http_register_then_login_disabled() {
    let app = TestApp::new();

    let (status, body) = app
        .request(
            "POST",
            "/api/auth/register",
            None,
            Some(serde_json::json!({
                "firstname": "John",
                "lastname": "Doe",
                "email": "john@example.com",
                "password": "password123",
            })),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["email"], "john@example.com");

    let (status, body) = app
        .request(
            "POST",
            "/api/auth/login",
            None,
            Some(serde_json::json!({
                "email": "john@example.com",
                "password": "password123",
            })),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], 303);
}

#[tokio::test]
async fn http_borrow_cycle() {
    let app = TestApp::new();
    let owner = app.login("owner@example.com");
    let reader = app.login("reader@example.com");

    let (status, body) = app
        .request(
            "POST",
            "/api/books",
            Some(&owner),
            Some(serde_json::json!({
                "title": "Dune",
                "author_name": "Frank Herbert",
                "isbn": "9780441013593",
                "shareable": true,
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let book_id = body.as_i64().unwrap();

    let (status, body) = app
        .request("POST", &format!("/api/books/borrow/{}", book_id), Some(&owner), None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "INVALID_OPERATION");

    let (status, body) = app
        .request("POST", &format!("/api/books/borrow/{}", book_id), Some(&reader), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    let tx_id = body.as_i64().unwrap();

    let (status, body) = app
        .request("POST", &format!("/api/books/borrow/{}", book_id), Some(&reader), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "ALREADY_BORROWED");

    let (status, _) = app
        .request(
            "PATCH",
            &format!("/api/books/approve/return/{}", tx_id),
            Some(&owner),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app
        .request("PATCH", &format!("/api/books/return/{}", tx_id), Some(&reader), None)
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app
        .request("GET", "/api/books/returned", Some(&owner), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_elements"], 1);

    let (status, _) = app
        .request(
            "PATCH",
            &format!("/api/books/approve/return/{}", tx_id),
            Some(&owner),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app
        .request("GET", "/api/books/borrowed?page=0&size=5", Some(&reader), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["size"], 5);
    assert_eq!(body["content"][0]["return_approved"], true);
}

#[tokio::test]
async fn http_unknown_book_is_404() {
    let app = TestApp::new();
    let token = app.login("reader@example.com");

    let (status, body) = app.request("GET", "/api/books/4242", Some(&token), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], 404);

    let (status, _) = app
        .request("GET", "/api/books/4242/cover", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn http_hidden_book_cover_is_owner_only() {
    let app = TestApp::new();
    let owner = app.login("owner@example.com");
    let reader = app.login("reader@example.com");
    let owner_id = app.state.auth.validate_token(&owner).unwrap().unwrap().id;
    let book_id = create_book(&app.state.db, &owner_id, "Private", false);

    let (status, body) = app
        .request("GET", &format!("/api/books/{}/cover", book_id), Some(&reader), None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "BOOK_UNAVAILABLE");

    // The owner passes the check; there is simply no cover yet.
    let (status, _) = app
        .request("GET", &format!("/api/books/{}/cover", book_id), Some(&owner), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn http_feedback_and_stats() {
    let app = TestApp::new();
    let owner = app.login("owner@example.com");
    let reader = app.login("reader@example.com");
    let owner_id = app.state.auth.validate_token(&owner).unwrap().unwrap().id;
    let book_id = create_book(&app.state.db, &owner_id, "Dune", true);

    let (status, _) = app
        .request(
            "POST",
            "/api/feedbacks",
            Some(&reader),
            Some(serde_json::json!({ "note": 4.5, "comment": "Great", "book_id": book_id })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = app
        .request("GET", &format!("/api/feedbacks/book/{}", book_id), Some(&reader), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["content"][0]["own_feedback"], true);

    let (status, body) = app.request("GET", "/api/stats", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["users"], 2);
    assert_eq!(body["displayable_books"], 1);
}
