//! Wire protocol for the line-oriented chat service
//!
//! One UTF-8 line per message, newline-terminated, in both directions.

pub mod command;
pub mod reply;

pub use command::{Command, ParseError};
pub use reply::Reply;
