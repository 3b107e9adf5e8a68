//! Paginated search

pub mod links;
mod walker;

pub use links::{CollapseMountPath, LinkRewriter, PassThrough};
pub use walker::{PaginationWalker, SearchLimits, SearchRequest};
