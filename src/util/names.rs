use thiserror::Error;

/// Longest account name accepted by the registry.
pub const MAX_ACCOUNT_NAME_LENGTH: usize = 64;

/// Reasons an account name is rejected before any request is made.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AccountNameError {
    #[error("Account name is empty")]
    Empty,
    #[error("Account name is longer than {MAX_ACCOUNT_NAME_LENGTH} characters")]
    TooLong,
    #[error("Account name contains invalid character {0:?}")]
    InvalidChar(char),
}

/// Validates an operator-supplied account name.
///
/// Names are substituted into URL templates verbatim, so only ASCII letters,
/// digits, `_`, `-` and `.` are allowed. Case is preserved and significant.
///
/// # Examples
///
/// ```
/// use postwatch::util::validate_account_name;
///
/// assert!(validate_account_name("Alice_FX").is_ok());
/// assert!(validate_account_name("../etc").is_err());
/// assert!(validate_account_name("").is_err());
/// ```
pub fn validate_account_name(name: &str) -> Result<&str, AccountNameError> {
    if name.is_empty() {
        return Err(AccountNameError::Empty);
    }
    if name.len() > MAX_ACCOUNT_NAME_LENGTH {
        return Err(AccountNameError::TooLong);
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
    {
        return Err(AccountNameError::InvalidChar(c));
    }
    if name.starts_with('.') {
        return Err(AccountNameError::InvalidChar('.'));
    }
    Ok(name)
}
