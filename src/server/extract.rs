//! Extractors whose rejections render through [`AppError`].

use crate::error::AppError;
use axum::extract::{FromRequest, FromRequestParts};

/// JSON body; malformed or incomplete payloads become validation errors.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(AppError))]
pub struct ApiJson<T>(pub T);

/// Path parameters; unparsable segments become validation errors.
#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(AppError))]
pub struct ApiPath<T>(pub T);

/// Query string; unparsable values become validation errors.
#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(AppError))]
pub struct ApiQuery<T>(pub T);
