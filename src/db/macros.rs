//! Backend dispatch macros for reducing code duplication.
//!
//! Pools and connections are enums with one variant per backend. When the body is
//! the same for every backend (closing, sizing, pinging) these macros expand the
//! three match arms at compile time with zero runtime overhead.

/// Run the same expression against whichever backend variant `$value` holds.
///
/// # Example
///
/// ```ignore
/// dispatch!(DbPool, self, p => p.size())
/// ```
#[macro_export]
macro_rules! dispatch {
    ($enum:ident, $value:expr, $inner:ident => $body:expr) => {
        match $value {
            $enum::MySql($inner) => $body,
            $enum::Postgres($inner) => $body,
            $enum::SQLite($inner) => $body,
        }
    };
}

pub use dispatch;
