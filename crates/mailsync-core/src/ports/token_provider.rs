//! Token provider port (driven/secondary port)
//!
//! Supplies access tokens for provider calls. Acquisition may suspend while
//! a refresh is in progress; when the refresh token itself is rejected the
//! call fails with [`ProviderError::Auth`] and the account must go through
//! interactive reauthentication.

use std::fmt;

use crate::domain::{newtypes::AccountId, ProviderError};

/// Bearer credential for a single account
///
/// The `Debug` output is redacted so tokens never reach the logs.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the raw bearer value
    pub fn secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(***)")
    }
}

/// Port trait for access token acquisition
#[async_trait::async_trait]
pub trait ITokenProvider: Send + Sync {
    /// Returns a valid token, refreshing it if needed
    async fn acquire_token(&self, account_id: &AccountId) -> Result<AccessToken, ProviderError>;

    /// Starts interactive reauthentication (consent prompt, browser flow)
    ///
    /// Resolves once the user completed it. Fails with
    /// [`ProviderError::Auth`] when the user declined or has not yet acted.
    async fn reauthenticate(&self, account_id: &AccountId) -> Result<(), ProviderError>;
}
