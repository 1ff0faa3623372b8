//! Discord presentation helpers.

pub mod embeds;
