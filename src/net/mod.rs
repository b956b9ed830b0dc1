pub mod http;

pub use http::{HttpError, HttpResponse, http_request};
