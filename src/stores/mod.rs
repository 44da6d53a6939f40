//! Repositories over a [`Conn`](crate::adapter::Conn).
//!
//! Every function takes the connection it should run on, so the same code
//! works against a pooled connection or inside a caller's transaction.

pub mod access_tokens;
pub mod companies;
pub mod documents;
pub mod settings;
pub mod users;
