//! Bearer-token acquisition and caching

mod store;
mod token;

pub use store::{SourcePrecedence, TokenProvider, TokenStore, TokenStoreBuilder};
pub use token::{BearerToken, IssuedToken, TokenSource, load_cache_file};
