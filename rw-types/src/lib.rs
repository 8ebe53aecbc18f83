#![deny(clippy::unwrap_used)]

pub mod category;
pub mod error;
pub mod product;
pub mod store;
pub mod url_rewrite;

pub use error::{ErrorScope, ReconcileError};

/// Splits a comma separated cell into trimmed, non-empty items.
pub fn split_list(s: &str) -> impl Iterator<Item = &str> {
    s.split(',').map(str::trim).filter(|s| !s.is_empty())
}

pub fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
