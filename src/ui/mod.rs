//! Terminal output for the `entity-store` binary.

pub mod icons;
pub mod output;
pub mod table;
pub mod theme;

pub use icons::Icons;
pub use output::{caution, cursors, deleted, failure, heading, link, saved, uid_line};
pub use table::{counts_table, records_table};
pub use theme::{theme, Theme};
