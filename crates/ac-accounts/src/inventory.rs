use std::collections::HashSet;
use std::sync::Arc;

use ac_auth::{HttpRequest, HttpResponse, LoginResult, SecretStore, Transport};
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::errors::InventoryError;

pub const DEFAULT_BASE_URL: &str = "https://mcacapi.lolyay.dev/api";

/// Refresh this long before the access token actually expires
const EXPIRY_MARGIN_MS: i64 = 30_000;

type Result<T> = std::result::Result<T, InventoryError>;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshTokenRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshTokenResponse {
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    /// Unix millis
    #[serde(default)]
    expiry: i64,
    #[serde(default)]
    success: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuickLoginResponse {
    #[serde(default)]
    refresh_token: Option<String>,
}

/// The signed-in inventory user
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InventoryUser {
    pub id: String,
    pub name: String,
}

/// Entry of the account listing
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InventorySummary {
    pub id: String,
    #[serde(default)]
    pub combo: Option<String>,
}

/// Full inventory record of a Minecraft account
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryAccount {
    pub id: String,
    #[serde(default)]
    pub combo: Option<String>,
    pub msa_refresh_token: String,
    /// Unix millis
    #[serde(default)]
    pub issued: i64,
    /// Unix millis
    #[serde(default)]
    pub last_checked: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub mcuuid: Option<String>,
}

/// Minecraft token minted by the inventory for one of its accounts
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DerivedAccessToken {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Serialize)]
struct UpdateAccountRequest<'a> {
    token: &'a str,
    username: &'a str,
    mcuuid: &'a str,
}

#[derive(Debug, Default)]
struct InventorySession {
    refresh_token: Option<String>,
    access_token: Option<String>,
    expiry_ms: i64,
    user: Option<InventoryUser>,
}

impl InventorySession {
    fn access_token_valid_at(&self, now_ms: i64) -> Option<&str> {
        self.access_token
            .as_deref()
            .filter(|_| now_ms < self.expiry_ms - EXPIRY_MARGIN_MS)
    }
}

/// Client for the external account inventory.
///
/// Authenticates with a rotating opaque refresh token of its own, unrelated
/// to Microsoft tokens. Each rotation is kept in memory and saved through
/// the [`SecretStore`]; a failed save is logged and retried on the next
/// rotation.
#[derive(Debug, Clone)]
pub struct InventoryClient {
    base_url: String,
    transport: Arc<dyn Transport>,
    secrets: Arc<dyn SecretStore>,
    session: Arc<Mutex<InventorySession>>,
}

impl InventoryClient {
    pub fn new(
        base_url: impl Into<String>,
        transport: Arc<dyn Transport>,
        secrets: Arc<dyn SecretStore>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            transport,
            secrets,
            session: Arc::new(Mutex::new(InventorySession::default())),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Pick up a previously saved refresh token; `false` if none is stored
    pub async fn load_saved_token(&self) -> Result<bool> {
        match self.secrets.load().await? {
            Some(token) => {
                self.set_refresh_token(token).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Replace the refresh token, dropping any access token minted from the old one
    pub async fn set_refresh_token(&self, token: String) {
        let mut session = self.session.lock().await;
        session.refresh_token = Some(token).filter(|t| !t.is_empty());
        session.access_token = None;
        session.expiry_ms = 0;
    }

    pub async fn is_configured(&self) -> bool {
        self.session.lock().await.refresh_token.is_some()
    }

    pub async fn user(&self) -> Option<InventoryUser> {
        self.session.lock().await.user.clone()
    }

    /// Current access token, refreshing it when missing or about to expire
    #[instrument(skip(self))]
    pub async fn ensure_valid_token(&self) -> Result<String> {
        let mut session = self.session.lock().await;
        let now = chrono::Utc::now().timestamp_millis();

        if let Some(token) = session.access_token_valid_at(now) {
            return Ok(token.to_string());
        }

        let refresh_token = session
            .refresh_token
            .clone()
            .ok_or(InventoryError::NotConfigured)?;

        info!("Refreshing inventory access token");
        let request = HttpRequest::post(self.url("/token/refresh")).json(&RefreshTokenRequest {
            refresh_token: &refresh_token,
        })?;
        let response: RefreshTokenResponse = self.send(request).await?.json()?;

        let (Some(new_refresh), Some(access_token), true) =
            (response.refresh_token, response.access_token, response.success)
        else {
            error!("Inventory rejected the token refresh");
            return Err(InventoryError::TokenRefreshFailed);
        };

        // the old refresh token is dead now; keep the new one in memory even
        // if persisting it fails
        session.refresh_token = Some(new_refresh.clone());
        session.access_token = Some(access_token.clone());
        session.expiry_ms = response.expiry;
        info!(expires_at = response.expiry, "Inventory access token refreshed");

        if let Err(e) = self.secrets.save(&new_refresh).await {
            error!(error = %e, "Failed to persist rotated inventory refresh token");
        }

        match self.fetch_user(&access_token).await {
            Ok(user) => {
                info!(name = %user.name, id = %user.id, "Signed in to account inventory");
                session.user = Some(user);
            }
            Err(e) => warn!(error = %e, "Failed to fetch inventory user details"),
        }

        Ok(access_token)
    }

    async fn fetch_user(&self, access_token: &str) -> Result<InventoryUser> {
        let request = HttpRequest::get(self.url("/users/@me")).bearer(access_token);
        Ok(self.send(request).await?.json()?)
    }

    /// Trade a one-time code for a refresh token, then sign in with it
    #[instrument(skip(self, code))]
    pub async fn quick_login(&self, code: &str) -> Result<String> {
        let request = HttpRequest::get(self.url(&format!("/token/quick/{code}")));
        let response: QuickLoginResponse = self.send(request).await?.json()?;
        let refresh_token = response
            .refresh_token
            .ok_or(InventoryError::MissingField("refreshToken"))?;

        self.set_refresh_token(refresh_token).await;
        self.ensure_valid_token().await
    }

    #[instrument(skip(self))]
    pub async fn list_accounts(&self) -> Result<Vec<InventorySummary>> {
        let token = self.ensure_valid_token().await?;
        let accounts: Vec<InventorySummary> = self
            .send(HttpRequest::get(self.url("/mcaccs")).bearer(token))
            .await?
            .json()?;

        info!("Fetched {} accounts from inventory", accounts.len());
        Ok(accounts)
    }

    #[instrument(skip(self))]
    pub async fn account(&self, id: &str) -> Result<InventoryAccount> {
        let token = self.ensure_valid_token().await?;
        Ok(self
            .send(HttpRequest::get(self.url(&format!("/mcaccs/{id}"))).bearer(token))
            .await?
            .json()?)
    }

    /// Minecraft token the inventory derives for one of its accounts
    #[instrument(skip(self))]
    pub async fn access_token(&self, id: &str) -> Result<DerivedAccessToken> {
        let token = self.ensure_valid_token().await?;
        Ok(self
            .send(HttpRequest::get(self.url(&format!("/mcaccs/{id}/at"))).bearer(token))
            .await?
            .json()?)
    }

    /// Push a rotated Microsoft refresh token back to the inventory
    #[deprecated(note = "the inventory rotates account tokens itself")]
    #[instrument(skip(self, login))]
    pub async fn update_refresh_token(&self, id: &str, login: &LoginResult) -> Result<()> {
        let token = self.ensure_valid_token().await?;
        let request = HttpRequest::put(self.url(&format!("/mcaccs/{id}/refreshtoken")))
            .bearer(token)
            .json(&UpdateAccountRequest {
                token: login.new_refresh_token().unwrap_or_default(),
                username: login.username().unwrap_or_default(),
                mcuuid: login.uuid().unwrap_or_default(),
            })?;
        self.send(request).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn delete_account(&self, id: &str) -> Result<()> {
        let token = self.ensure_valid_token().await?;
        self.send(HttpRequest::delete(self.url(&format!("/mcaccs/{id}"))).bearer(token))
            .await?;
        info!("Deleted account from inventory");
        Ok(())
    }

    /// A uniformly random listed account whose id is not in `existing_ids`
    pub async fn random_available(
        &self,
        existing_ids: &HashSet<String>,
    ) -> Result<Option<InventorySummary>> {
        let accounts = self.list_accounts().await?;
        let available: Vec<_> = accounts
            .iter()
            .filter(|account| !existing_ids.contains(&account.id))
            .collect();

        let Some(selected) = available.choose(&mut rand::rng()) else {
            warn!(
                "No available accounts (all {} are already added)",
                accounts.len()
            );
            return Ok(None);
        };

        debug!(
            id = %selected.id,
            available = available.len(),
            "Selected random inventory account"
        );
        Ok(Some((*selected).clone()))
    }

    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        Ok(self.transport.send(request).await?.error_for_status()?)
    }
}
