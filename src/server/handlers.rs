//! HTTP request handlers.

use crate::auth::Registration;
use crate::db::{self, BorrowedBook, Page, PageRequest};
use crate::error::{AppError, Result};
use crate::server::AppState;
use crate::server::extract::{ApiJson, ApiPath, ApiQuery};
use crate::server::state::Stats;
use crate::service::{BookRequest, BookResponse, FeedbackRequest, FeedbackResponse};
use crate::storage;
use axum::{
    Json,
    body::Body,
    extract::{Multipart, State},
    http::{HeaderMap, StatusCode, header},
    response::{Html, Response},
};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;

/// `page`/`size` query parameters.
#[derive(Debug, Deserialize)]
pub struct PageParams {
    #[serde(default)]
    page: u32,
    #[serde(default = "default_page_size")]
    size: u32,
}

fn default_page_size() -> u32 {
    10
}

impl From<PageParams> for PageRequest {
    fn from(params: PageParams) -> Self {
        PageRequest::new(params.page, params.size)
    }
}

// ============================================================================
// WEB PAGES
// ============================================================================

/// Index page (simple HTML).
pub async fn index(State(state): State<AppState>) -> Result<Html<String>> {
    let stats = state.stats()?;
    let html = format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <title>{title}</title>
    <style>
        body {{ font-family: system-ui, sans-serif; max-width: 600px; margin: 2rem auto; padding: 0 1rem; }}
        .stats {{ background: #f5f5f5; padding: 1rem; border-radius: 8px; margin: 1rem 0; }}
    </style>
</head>
<body>
    <h1>{title}</h1>
    <div class="stats">
        <p><strong>{books}</strong> books available to borrow</p>
        <p><strong>{borrows}</strong> books currently lent out</p>
    </div>
    <ul>
        <li><a href="/api/books">Books (JSON)</a></li>
        <li><a href="/api/stats">API Stats (JSON)</a></li>
    </ul>
</body>
</html>"#,
        title = state.config.server.title,
        books = stats.displayable_books,
        borrows = stats.active_borrows,
    );

    Ok(Html(html))
}

// ============================================================================
// AUTH API
// ============================================================================

/// Registration request.
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    firstname: String,
    lastname: String,
    email: String,
    password: String,
}

/// Registration response.
#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    user_id: String,
    email: String,
}

/// Activation query.
#[derive(Debug, Deserialize)]
pub struct ActivationParams {
    token: String,
}

/// Login request.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    email: String,
    password: String,
}

/// Login response.
#[derive(Debug, Serialize)]
pub struct LoginResponse {
    token: String,
    user_id: String,
    email: String,
    full_name: String,
    roles: Vec<String>,
}

/// Auth register.
pub async fn auth_register(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<RegisterRequest>,
) -> Result<(StatusCode, Json<RegisterResponse>)> {
    let user = state.auth.register(&Registration {
        firstname: req.firstname,
        lastname: req.lastname,
        email: req.email,
        password: req.password,
    })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(RegisterResponse {
            user_id: user.id,
            email: user.email,
        }),
    ))
}

/// Auth activate.
pub async fn auth_activate(
    State(state): State<AppState>,
    ApiQuery(params): ApiQuery<ActivationParams>,
) -> Result<StatusCode> {
    state.auth.activate(&params.token)?;
    Ok(StatusCode::OK)
}

/// Auth login.
pub async fn auth_login(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<LoginRequest>,
) -> Result<Json<LoginResponse>> {
    let (user, token) = state.auth.login(&req.email, &req.password)?;

    Ok(Json(LoginResponse {
        token,
        full_name: user.full_name(),
        user_id: user.id,
        email: user.email,
        roles: user.roles,
    }))
}

/// Auth logout.
pub async fn auth_logout(State(state): State<AppState>, headers: HeaderMap) -> Result<StatusCode> {
    if let Some(token) = extract_token(&headers) {
        state.auth.logout(&token)?;
    }
    Ok(StatusCode::OK)
}

/// Get current user info.
pub async fn auth_me(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<db::User>> {
    let user = get_authenticated_user(&state, &headers).await?;
    Ok(Json(user))
}

// ============================================================================
// BOOK API
// ============================================================================

/// Create a book.
pub async fn book_create(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<BookRequest>,
) -> Result<(StatusCode, Json<i64>)> {
    let user = get_authenticated_user(&state, &headers).await?;
    let id = state.books.save(&req, &user.id)?;
    Ok((StatusCode::CREATED, Json(id)))
}

/// Update a book.
pub async fn book_update(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiPath(id): ApiPath<i64>,
    ApiJson(req): ApiJson<BookRequest>,
) -> Result<Json<i64>> {
    let user = get_authenticated_user(&state, &headers).await?;
    Ok(Json(state.books.update(id, &req, &user.id)?))
}

/// Book details.
pub async fn book_get(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiPath(id): ApiPath<i64>,
) -> Result<Json<BookResponse>> {
    get_authenticated_user(&state, &headers).await?;
    Ok(Json(state.books.find_by_id(id)?))
}

/// Displayable books.
pub async fn book_list(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiQuery(params): ApiQuery<PageParams>,
) -> Result<Json<Page<BookResponse>>> {
    get_authenticated_user(&state, &headers).await?;
    Ok(Json(state.books.find_all_books(params.into())?))
}

/// Caller's own books.
pub async fn book_list_owner(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiQuery(params): ApiQuery<PageParams>,
) -> Result<Json<Page<BookResponse>>> {
    let user = get_authenticated_user(&state, &headers).await?;
    Ok(Json(
        state.books.find_all_books_by_owner(&user.id, params.into())?,
    ))
}

/// Books the caller has borrowed.
pub async fn book_list_borrowed(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiQuery(params): ApiQuery<PageParams>,
) -> Result<Json<Page<BorrowedBook>>> {
    let user = get_authenticated_user(&state, &headers).await?;
    Ok(Json(
        state
            .borrowing
            .find_all_borrowed_books(&user.id, params.into())?,
    ))
}

/// Returns claimed on the caller's books.
pub async fn book_list_returned(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiQuery(params): ApiQuery<PageParams>,
) -> Result<Json<Page<BorrowedBook>>> {
    let user = get_authenticated_user(&state, &headers).await?;
    Ok(Json(
        state
            .borrowing
            .find_all_returned_books(&user.id, params.into())?,
    ))
}

/// Toggle shareable.
pub async fn book_toggle_shareable(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiPath(id): ApiPath<i64>,
) -> Result<Json<i64>> {
    let user = get_authenticated_user(&state, &headers).await?;
    Ok(Json(state.books.update_shareable_status(id, &user.id)?))
}

/// Toggle archived.
pub async fn book_toggle_archived(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiPath(id): ApiPath<i64>,
) -> Result<Json<i64>> {
    let user = get_authenticated_user(&state, &headers).await?;
    Ok(Json(state.books.update_archived_status(id, &user.id)?))
}

/// Borrow a book; returns the transaction ID.
pub async fn book_borrow(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiPath(book_id): ApiPath<i64>,
) -> Result<Json<i64>> {
    let user = get_authenticated_user(&state, &headers).await?;
    Ok(Json(state.borrowing.borrow(book_id, &user.id)?))
}

/// Borrower marks a transaction returned.
pub async fn book_return(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiPath(transaction_id): ApiPath<i64>,
) -> Result<Json<i64>> {
    let user = get_authenticated_user(&state, &headers).await?;
    Ok(Json(state.borrowing.mark_returned(transaction_id, &user.id)?))
}

/// Owner approves a return.
pub async fn book_approve_return(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiPath(transaction_id): ApiPath<i64>,
) -> Result<Json<i64>> {
    let user = get_authenticated_user(&state, &headers).await?;
    Ok(Json(
        state.borrowing.approve_return(transaction_id, &user.id)?,
    ))
}

/// Upload a cover (multipart field `file`).
pub async fn book_upload_cover(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiPath(id): ApiPath<i64>,
    mut multipart: Multipart,
) -> Result<StatusCode> {
    let user = get_authenticated_user(&state, &headers).await?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(format!("Invalid multipart body: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let bytes = field
            .bytes()
            .await
            .map_err(|e| AppError::Validation(format!("Failed to read upload: {}", e)))?;
        state.books.upload_cover(id, &user.id, &bytes)?;
        return Ok(StatusCode::ACCEPTED);
    }

    Err(AppError::Validation("Missing 'file' field".to_string()))
}

/// Stream the stored cover.
pub async fn book_cover(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiPath(id): ApiPath<i64>,
) -> Result<Response<Body>> {
    let user = get_authenticated_user(&state, &headers).await?;
    let path = state
        .books
        .cover_path(id, &user.id)?
        .ok_or_else(|| AppError::NotFound(format!("No cover for book: {}", id)))?;

    let file = tokio::fs::File::open(&path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            AppError::NotFound(format!("No cover for book: {}", id))
        } else {
            AppError::Io(e)
        }
    })?;
    let stream = ReaderStream::new(file);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, storage::content_type_for(&path))
        .header(header::CACHE_CONTROL, "private, max-age=86400")
        .body(Body::from_stream(stream))
        .map_err(|e| AppError::Internal(e.to_string()))
}

// ============================================================================
// FEEDBACK API
// ============================================================================

/// Leave feedback.
pub async fn feedback_create(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<FeedbackRequest>,
) -> Result<(StatusCode, Json<i64>)> {
    let user = get_authenticated_user(&state, &headers).await?;
    let id = state.feedback.save(&req, &user.id)?;
    Ok((StatusCode::CREATED, Json(id)))
}

/// Feedback on a book.
pub async fn feedback_by_book(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiPath(book_id): ApiPath<i64>,
    ApiQuery(params): ApiQuery<PageParams>,
) -> Result<Json<Page<FeedbackResponse>>> {
    let user = get_authenticated_user(&state, &headers).await?;
    Ok(Json(state.feedback.find_all_feedbacks_by_book(
        book_id,
        &user.id,
        params.into(),
    )?))
}

// ============================================================================
// STATS API
// ============================================================================

/// API: counters.
pub async fn api_stats(State(state): State<AppState>) -> Result<Json<Stats>> {
    Ok(Json(state.stats()?))
}

// ============================================================================
// HELPERS
// ============================================================================

/// Extract token from Authorization header.
fn extract_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.to_string())
}

/// Get authenticated user from token.
async fn get_authenticated_user(state: &AppState, headers: &HeaderMap) -> Result<db::User> {
    let token = extract_token(headers)
        .ok_or_else(|| AppError::Unauthenticated("Missing Authorization header".to_string()))?;

    state
        .auth
        .validate_token(&token)?
        .ok_or_else(|| AppError::Unauthenticated("Invalid or expired token".to_string()))
}
