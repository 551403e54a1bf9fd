//! Microsoft account login chain for Minecraft
//!
//! This crate turns a long-lived Microsoft refresh token into a Minecraft
//! access token, caching the expensive hops and keeping the refresh token
//! safe on disk.
//!
//! # Authentication Flow
//!
//! [`LoginChain::login`] walks these hops, short-circuiting through its caches
//! wherever it can:
//!
//! 1. Refresh the Microsoft access token (the refresh token rotates)
//! 2. Xbox Live authentication
//! 3. XSTS authorization
//! 4. Minecraft Services `login_with_xbox` (rate limited upstream)
//! 5. Entitlement check
//! 6. Profile retrieval
//!
//! # Example
//!
//! ```no_run
//! use ac_auth::{AuthConfig, LoginChain, RedirectListener};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let chain = LoginChain::new(AuthConfig::default())?;
//!
//! // Let the user sign in through the browser
//! let listener = RedirectListener::for_chain(chain.clone());
//! let (_, token_rx) = listener.capture_refresh_token().await?;
//! println!("Visit: {}", chain.authorize_url()?);
//!
//! if let Some(refresh_token) = token_rx.await? {
//!     let result = chain.login(&refresh_token, None).await;
//!     if result.is_good() {
//!         println!("Logged in as: {:?}", result.username());
//!     } else if result.is_rate_limited() {
//!         println!("Rate limited, try again in a few minutes");
//!     }
//!     // Persist result.new_refresh_token(): the old token is now dead
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Token Storage
//!
//! A [`SecretStore`] keeps the refresh token between runs, either in plain
//! text ([`StorageMode::Lite`]) or encrypted with local key material.
//!
//! ```
//! use ac_auth::{StorageMode, VaultConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let dir = tempfile::tempdir()?;
//! let store = VaultConfig::in_dir(StorageMode::Encrypted, dir.path()).open();
//!
//! store.save("M.C123_refresh").await?;
//! assert_eq!(store.load().await?.as_deref(), Some("M.C123_refresh"));
//! # Ok(())
//! # }
//! # tokio_test::block_on(example()).unwrap();
//! ```
//!
//! # Important Notes
//!
//! - Refresh tokens rotate on every use; always save `new_refresh_token`,
//!   even from a failed [`LoginResult`]
//! - Tokens are never logged
//! - The MC access token expires after 24 hours

pub mod cache;
pub mod chain;
pub mod config;
pub mod crypto;
pub mod errors;
pub mod models;
pub mod redirect;
pub mod session;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod transport;
pub mod vault;

// Re-export main types
pub use cache::{AuthCaches, CacheEntry, TokenCache};
pub use chain::LoginChain;
pub use config::{AuthConfig, CacheTtls, Endpoints, HttpTimeouts};
pub use errors::{AuthError, Result, VaultError, XstsError};
pub use models::McProfile;
pub use redirect::{RedirectCallback, RedirectListener};
pub use session::{Hop, LoginFailure, LoginResult, MsTokens, XblAuth};
pub use transport::{Body, HttpRequest, HttpResponse, Method, ReqwestTransport, Transport};
pub use vault::{EncryptedSecretStore, PlainSecretStore, SecretStore, StorageMode, VaultConfig};
