//! Token lifecycle primitives for the campus portal session
//!
//! Holds the access/refresh token pair, persists it, and talks to the two
//! token endpoints. Everything here is stateless with respect to concurrency:
//! the single-flight refresh discipline lives in `portal-session`, which is
//! the only caller of `token::refresh_access_token` on the request path.
//!
//! Token flow:
//! 1. Caller logs in via `token::login()` → `TokenPair`
//! 2. Pair persisted via `store::TokenStore::set()`
//! 3. Request path reads `TokenStore::access_token()` for the bearer header
//! 4. On a 401 the session coordinator calls `token::refresh_access_token()`
//! 5. Rotated pair saved via `TokenStore::set()`, or the store is cleared on failure

pub mod constants;
pub mod error;
pub mod pair;
pub mod store;
pub mod token;

pub use constants::*;
pub use error::{Error, Result};
pub use pair::{AccessToken, RefreshToken, TokenPair};
pub use store::TokenStore;
pub use token::{AuthEndpoints, RefreshedTokens, login, refresh_access_token};
