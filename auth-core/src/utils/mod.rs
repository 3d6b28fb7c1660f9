pub mod password;

pub use password::{CredentialVerifier, Password, PasswordHashString};
