//! Password policy validation.
//!
//! Applied to new passwords during password change.

use std::fmt;

use serde::Deserialize;

/// Password requirements, part of the core configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PasswordPolicy {
    #[serde(default = "default_min_length")]
    pub min_length: usize,
    #[serde(default)]
    pub require_uppercase: bool,
    #[serde(default)]
    pub require_number: bool,
    #[serde(default)]
    pub require_special: bool,
}

fn default_min_length() -> usize {
    8
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            min_length: default_min_length(),
            require_uppercase: false,
            require_number: false,
            require_special: false,
        }
    }
}

/// Errors related to password policy validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    /// Password is too short.
    PasswordTooShort {
        min_length: usize,
        actual_length: usize,
    },
    /// Password missing uppercase letter.
    PasswordMissingUppercase,
    /// Password missing number.
    PasswordMissingNumber,
    /// Password missing special character.
    PasswordMissingSpecial,
    /// New password equals the current one.
    PasswordUnchanged,
}

impl fmt::Display for PolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyError::PasswordTooShort {
                min_length,
                actual_length,
            } => write!(
                f,
                "Password must be at least {} characters (got {})",
                min_length, actual_length
            ),
            PolicyError::PasswordMissingUppercase => {
                write!(f, "Password must contain at least one uppercase letter")
            }
            PolicyError::PasswordMissingNumber => {
                write!(f, "Password must contain at least one number")
            }
            PolicyError::PasswordMissingSpecial => {
                write!(f, "Password must contain at least one special character")
            }
            PolicyError::PasswordUnchanged => {
                write!(f, "New password must differ from the current password")
            }
        }
    }
}

impl std::error::Error for PolicyError {}

impl PasswordPolicy {
    /// Returns the first violation found.
    pub fn validate(&self, password: &str) -> Result<(), PolicyError> {
        match self.violations(password).into_iter().next() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// All violations, in check order.
    pub fn violations(&self, password: &str) -> Vec<PolicyError> {
        let mut errors = Vec::new();
        let length = password.chars().count();

        if length < self.min_length {
            errors.push(PolicyError::PasswordTooShort {
                min_length: self.min_length,
                actual_length: length,
            });
        }

        if self.require_uppercase && !password.chars().any(|c| c.is_uppercase()) {
            errors.push(PolicyError::PasswordMissingUppercase);
        }

        if self.require_number && !password.chars().any(|c| c.is_ascii_digit()) {
            errors.push(PolicyError::PasswordMissingNumber);
        }

        // Anything printable that is neither a letter, a digit nor whitespace.
        if self.require_special
            && !password
                .chars()
                .any(|c| !c.is_alphanumeric() && !c.is_whitespace() && !c.is_control())
        {
            errors.push(PolicyError::PasswordMissingSpecial);
        }

        errors
    }
}
