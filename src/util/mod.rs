//! Utility functions shared by the engine and the sinks.
//!
//! - **Account names**: validation before names reach URL templates
//! - **Text processing**: sanitizing and shortening feed text for chat messages

mod names;
mod text;

pub use names::{validate_account_name, AccountNameError, MAX_ACCOUNT_NAME_LENGTH};
pub use text::{sanitize_text, truncate_description};

/// Description length limit applied to rendered posts
pub const MAX_DESCRIPTION_LENGTH: usize = 500;
