//! Secret handling utilities.
//!
//! Re-exports secrecy types for working with connection strings and
//! other sensitive configuration.

pub use secrecy::{ExposeSecret, SecretBox, SecretString};
