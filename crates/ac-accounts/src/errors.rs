use std::path::PathBuf;

use ac_auth::{AuthError, Hop, LoginFailure, VaultError};
use thiserror::Error;

/// Errors raised while loading an account or building its game session
#[derive(Error, Debug)]
pub enum AccountError {
    #[error("Minecraft login is rate limited, wait a couple of minutes before retrying")]
    RateLimited,

    #[error("Account does not own Minecraft")]
    NotOwned,

    #[error("Refresh token was rejected - the account must sign in again")]
    InvalidGrant,

    #[error("Login failed at the {hop} step")]
    Upstream { hop: Hop },

    #[error("Failed to fetch the Minecraft profile: {0}")]
    Profile(#[source] AuthError),

    #[error("External accounts need a signed-in account inventory")]
    MissingInventory,

    #[error("Account inventory error: {0}")]
    Inventory(#[from] InventoryError),

    #[error("Stopped before the account could be loaded")]
    Stopped,
}

impl AccountError {
    pub fn from_failure(failure: Option<LoginFailure>) -> Self {
        match failure {
            Some(LoginFailure::RateLimited) => Self::RateLimited,
            Some(LoginFailure::NotOwned) => Self::NotOwned,
            Some(LoginFailure::InvalidGrant) => Self::InvalidGrant,
            Some(LoginFailure::Upstream { hop }) => Self::Upstream { hop },
            None => Self::Upstream {
                hop: Hop::TokenRefresh,
            },
        }
    }

    /// Retrying the same account can never succeed
    pub fn is_irrecoverable(&self) -> bool {
        matches!(self, Self::NotOwned | Self::InvalidGrant)
    }
}

/// Errors raised by the account inventory client
#[derive(Error, Debug)]
pub enum InventoryError {
    #[error("Account inventory is not configured - sign in first")]
    NotConfigured,

    #[error("Account inventory rejected the token refresh")]
    TokenRefreshFailed,

    #[error("Account inventory response is missing {0}")]
    MissingField(&'static str),

    #[error(transparent)]
    Transport(#[from] AuthError),

    #[error("Failed to persist the inventory token: {0}")]
    Vault(#[from] VaultError),
}

#[derive(Debug, Error)]
pub enum AccountStoreError {
    #[error(
        "Project directories are unavailable - this usually indicates an unsupported OS or missing home directory"
    )]
    ProjectDirectoriesUnavailable,

    #[error("Failed to create directory '{path}': {source}")]
    DirectoryCreationFailed {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to read accounts file '{path}': {source}")]
    AccountsFileReadFailed {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to write accounts file '{path}': {source}")]
    AccountsFileWriteFailed {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to parse accounts file '{path}': {source}")]
    AccountsParsingFailed {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to serialize accounts: {source}")]
    AccountsSerializationFailed {
        #[source]
        source: anyhow::Error,
    },

    #[error("Account of index '{tried_index}' doesn't exist, the accounts len is '{accounts_count}'")]
    AccountDoesntExist {
        tried_index: usize,
        accounts_count: usize,
    },
}
