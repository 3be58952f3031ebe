//! HTTP server and routes.

mod extract;
mod handlers;
mod state;

pub use state::{AppState, Stats};

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, patch, post},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Multipart framing on top of the raw cover bytes.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let upload_limit = state.config.storage.max_cover_bytes + MULTIPART_OVERHEAD;

    let auth_routes = Router::new()
        .route("/register", post(handlers::auth_register))
        .route("/activate", get(handlers::auth_activate))
        .route("/login", post(handlers::auth_login))
        .route("/logout", post(handlers::auth_logout))
        .route("/me", get(handlers::auth_me));

    let book_routes = Router::new()
        .route("/", get(handlers::book_list).post(handlers::book_create))
        .route("/owner", get(handlers::book_list_owner))
        .route("/borrowed", get(handlers::book_list_borrowed))
        .route("/returned", get(handlers::book_list_returned))
        .route(
            "/{id}",
            get(handlers::book_get).put(handlers::book_update),
        )
        .route("/{id}/cover", get(handlers::book_cover))
        .route(
            "/cover/{id}",
            post(handlers::book_upload_cover).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/shareable/{id}", patch(handlers::book_toggle_shareable))
        .route("/archived/{id}", patch(handlers::book_toggle_archived))
        // Ledger
        .route("/borrow/{id}", post(handlers::book_borrow))
        .route("/return/{id}", patch(handlers::book_return))
        .route("/approve/return/{id}", patch(handlers::book_approve_return));

    let feedback_routes = Router::new()
        .route("/", post(handlers::feedback_create))
        .route("/book/{book_id}", get(handlers::feedback_by_book));

    Router::new()
        .route("/", get(handlers::index))
        .route("/api/stats", get(handlers::api_stats))
        .nest("/api/auth", auth_routes)
        .nest("/api/books", book_routes)
        .nest("/api/feedbacks", feedback_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
