pub mod client;
pub mod documents;

pub use client::{Change, TestCache, blog_schema, init_tracing};
pub use documents::{document, identifier, resource, text_attributes};
