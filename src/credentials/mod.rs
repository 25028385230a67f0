//! # Credentials Module
//!
//! Pool of provider credentials with daily quotas and atomic reservation.

pub mod pool;

pub use pool::{suffix_of, CredentialPool, CredentialStatus, ReservedCredential, SUFFIX_LEN};
