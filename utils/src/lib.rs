//! Shared leaf utilities for the Quarry engine client crates.

pub mod sidelog;
pub mod splitter;

pub use sidelog::SideLog;
pub use splitter::{LINE_SEPARATORS, NUL_SEPARATOR, SplitBuffer};
