//! Domain services. Every operation takes the acting user explicitly.

mod books;
mod borrowing;
mod feedback;

pub use books::{BookRequest, BookResponse, BookService};
pub use borrowing::BorrowService;
pub use feedback::{FeedbackRequest, FeedbackResponse, FeedbackService};
