use std::sync::Arc;

use reqwest::StatusCode;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::cache::AuthCaches;
use crate::config::{AuthConfig, RP_MINECRAFT, RP_XBOXLIVE_AUTH};
use crate::errors::{AuthError, Result, XstsError};
use crate::models::*;
use crate::session::{Hop, LoginFailure, LoginResult, MsTokens, XblAuth};
use crate::transport::{HttpRequest, ReqwestTransport, Transport};

/// Microsoft → Xbox Live → XSTS → Minecraft Services login chain.
///
/// Owns its caches; clones share them. Independent chains (one per test,
/// one per launcher profile) never see each other's entries.
#[derive(Debug, Clone)]
pub struct LoginChain {
    config: AuthConfig,
    transport: Arc<dyn Transport>,
    caches: Arc<AuthCaches>,
}

impl LoginChain {
    /// Chain over a fresh `reqwest` client
    pub fn new(config: AuthConfig) -> Result<Self> {
        let transport = Arc::new(ReqwestTransport::new(&config)?);
        Ok(Self::with_transport(config, transport))
    }

    pub fn with_transport(config: AuthConfig, transport: Arc<dyn Transport>) -> Self {
        let caches = Arc::new(AuthCaches::new(&config.cache_ttls));
        Self {
            config,
            transport,
            caches,
        }
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub fn caches(&self) -> &AuthCaches {
        &self.caches
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    /// Authorization URL the user opens in a browser
    pub fn authorize_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.config.endpoints.ms_authorize)?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.config.client_id)
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", &self.config.redirect_uri())
            .append_pair("scope", &self.config.scope)
            .append_pair("prompt", "select_account");

        debug!("Built authorize URL: {}", url);
        Ok(url)
    }

    /// Exchange an authorization code for Microsoft tokens
    #[instrument(skip(self, code))]
    pub async fn exchange_code(&self, code: &str) -> Result<MsTokens> {
        let redirect_uri = self.config.redirect_uri();
        let request = HttpRequest::post(&self.config.endpoints.ms_token).form([
            ("client_id", self.config.client_id.as_str()),
            ("code", code),
            ("grant_type", "authorization_code"),
            ("redirect_uri", redirect_uri.as_str()),
            ("scope", self.config.scope.as_str()),
        ]);

        debug!("Exchanging authorization code for tokens");
        self.token_grant(request).await
    }

    /// Redeem a refresh token; upstream rotates it on every use
    #[instrument(skip(self, refresh_token))]
    pub async fn refresh_access_token(&self, refresh_token: &str) -> Result<MsTokens> {
        let redirect_uri = self.config.redirect_uri();
        let request = HttpRequest::post(&self.config.endpoints.ms_token).form([
            ("client_id", self.config.client_id.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
            ("redirect_uri", redirect_uri.as_str()),
            ("scope", self.config.scope.as_str()),
        ]);

        debug!("Refreshing Microsoft access token");
        self.token_grant(request).await
    }

    async fn token_grant(&self, request: HttpRequest) -> Result<MsTokens> {
        let response = self.transport.send(request).await?;

        if !response.is_success() && response.body.contains("invalid_grant") {
            return Err(AuthError::OAuthInvalidGrant);
        }

        let token_response: MsTokenResponse = response.error_for_status()?.json()?;
        Ok(MsTokens::new(
            token_response.access_token,
            token_response.refresh_token,
            token_response.expires_in,
        ))
    }

    /// Authenticate with Xbox Live
    #[instrument(skip(self, ms_access_token))]
    pub async fn xbl_authenticate(&self, ms_access_token: &str) -> Result<XblAuth> {
        let request = XblAuthRequest {
            properties: XblAuthProperties {
                auth_method: "RPS".to_string(),
                site_name: "user.auth.xboxlive.com".to_string(),
                rps_ticket: format!("d={ms_access_token}"),
            },
            relying_party: RP_XBOXLIVE_AUTH.to_string(),
            token_type: "JWT".to_string(),
        };

        debug!("Authenticating with Xbox Live");
        let response = self
            .transport
            .send(HttpRequest::post(&self.config.endpoints.xbl_authenticate).json(&request)?)
            .await?
            .error_for_status()?;

        let xbl_response: XboxTokenResponse = response.json()?;
        let uhs = xbl_response
            .user_hash()
            .ok_or_else(|| AuthError::InvalidResponse("Missing XUI claims".to_string()))?
            .to_string();

        Ok(XblAuth {
            token: xbl_response.token,
            uhs,
        })
    }

    /// Exchange an XBL token for an XSTS token scoped to Minecraft Services
    #[instrument(skip(self, xbl_token))]
    pub async fn xsts_authorize(&self, xbl_token: &str) -> Result<String> {
        let request = XstsAuthRequest {
            properties: XstsAuthProperties {
                sandbox_id: "RETAIL".to_string(),
                user_tokens: vec![xbl_token.to_string()],
            },
            relying_party: RP_MINECRAFT.to_string(),
            token_type: "JWT".to_string(),
        };

        debug!("Authorizing with XSTS");
        let response = self
            .transport
            .send(HttpRequest::post(&self.config.endpoints.xsts_authorize).json(&request)?)
            .await?;

        if response.status == StatusCode::UNAUTHORIZED
            && let Ok(error_response) = response.json::<XstsErrorResponse>()
        {
            return Err(XstsError::from_xerr(error_response.xerr).into());
        }

        let xsts_response: XboxTokenResponse = response.error_for_status()?.json()?;
        Ok(xsts_response.token)
    }

    /// Trade the Xbox identity for a Minecraft access token
    #[instrument(skip(self, uhs, xsts_token))]
    pub async fn login_with_xbox(&self, uhs: &str, xsts_token: &str) -> Result<String> {
        let request = McLoginRequest {
            identity_token: format!("XBL3.0 x={uhs};{xsts_token}"),
        };

        debug!("Logging in to Minecraft Services");
        let response = self
            .transport
            .send(HttpRequest::post(&self.config.endpoints.mc_login).json(&request)?)
            .await?
            .error_for_status()?;

        let mc_response: McLoginResponse = response.json()?;
        Ok(mc_response.access_token)
    }

    /// Whether the account owns the game
    #[instrument(skip(self, mc_access_token))]
    pub async fn check_ownership(&self, mc_access_token: &str) -> Result<bool> {
        debug!("Checking Minecraft entitlements");
        let response = self
            .transport
            .send(HttpRequest::get(&self.config.endpoints.mc_entitlements).bearer(mc_access_token))
            .await?
            .error_for_status()?;

        let entitlements: EntitlementsResponse = response.json()?;
        Ok(entitlements.has_game_ownership())
    }

    /// Fetch Minecraft profile
    #[instrument(skip(self, mc_access_token))]
    pub async fn fetch_profile(&self, mc_access_token: &str) -> Result<McProfile> {
        debug!("Fetching Minecraft profile");
        let response = self
            .transport
            .send(HttpRequest::get(&self.config.endpoints.mc_profile).bearer(mc_access_token))
            .await?
            .error_for_status()?;

        let profile: McProfile = response.json()?;
        debug!(uuid = %profile.id, name = %profile.name, "Fetched profile");
        Ok(profile)
    }

    /// Run the chain for a stored refresh token.
    ///
    /// Never fails: hop errors are logged and reported through the returned
    /// [`LoginResult`]. When `account_uuid` is known, a cached Minecraft token
    /// for it is tried before the Xbox hops.
    #[instrument(skip(self, refresh_token))]
    pub async fn login(&self, refresh_token: &str, account_uuid: Option<&str>) -> LoginResult {
        if let Some(cached) = self.caches.login_data.get(refresh_token)
            && cached.is_good()
        {
            debug!("Login data cache hit");
            return cached;
        }

        let ms = match self.refresh_access_token(refresh_token).await {
            Ok(ms) => ms,
            Err(AuthError::OAuthInvalidGrant) => {
                warn!(hop = %Hop::TokenRefresh, account = ?account_uuid, "refresh token rejected");
                return LoginResult::failed(LoginFailure::InvalidGrant, None);
            }
            Err(e) => return hop_failed(Hop::TokenRefresh, account_uuid, &e, None),
        };
        let new_refresh = Some(ms.refresh_token.clone());

        if let Some(uuid) = account_uuid
            && let Some(result) = self
                .try_cached_mc_token(refresh_token, uuid, &ms.refresh_token)
                .await
        {
            return result;
        }

        let xbl = match self.caches.xbl.get(&ms.access_token) {
            Some(xbl) => {
                debug!("XBL cache hit");
                xbl
            }
            None => match self.xbl_authenticate(&ms.access_token).await {
                Ok(xbl) => {
                    self.caches.xbl.insert(ms.access_token.clone(), xbl.clone());
                    xbl
                }
                Err(e) => return hop_failed(Hop::XblAuth, account_uuid, &e, new_refresh),
            },
        };

        let xsts_token = match self.xsts_authorize(&xbl.token).await {
            Ok(token) => token,
            Err(e) => return hop_failed(Hop::XstsAuth, account_uuid, &e, new_refresh),
        };

        let mc_token = match self.login_with_xbox(&xbl.uhs, &xsts_token).await {
            Ok(token) => token,
            Err(e) => {
                warn!(
                    hop = %Hop::McLogin,
                    account = ?account_uuid,
                    error = %e,
                    "Minecraft login refused, likely rate limited"
                );
                return LoginResult::rate_limited(new_refresh);
            }
        };

        match self.check_ownership(&mc_token).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(account = ?account_uuid, "account does not own Minecraft");
                return LoginResult::failed(LoginFailure::NotOwned, new_refresh);
            }
            Err(e) => return hop_failed(Hop::Entitlements, account_uuid, &e, new_refresh),
        }

        let profile = match self.fetch_profile(&mc_token).await {
            Ok(profile) => profile,
            Err(e) => return hop_failed(Hop::Profile, account_uuid, &e, new_refresh),
        };

        self.caches.mc.insert(profile.id.clone(), mc_token.clone());
        let skin_url = profile.active_skin_url().map(str::to_string);
        let result = LoginResult::success(mc_token, new_refresh, profile.id, profile.name)
            .with_skin_url(skin_url);
        self.caches
            .login_data
            .insert(refresh_token.to_string(), result.clone());

        info!(uuid = ?result.uuid(), username = ?result.username(), "Login complete");
        result
    }

    /// Reuse the cached Minecraft token for `uuid` if it still fetches a profile
    async fn try_cached_mc_token(
        &self,
        refresh_token: &str,
        uuid: &str,
        new_refresh: &str,
    ) -> Option<LoginResult> {
        let mc_token = self.caches.mc.get(uuid)?;

        match self.fetch_profile(&mc_token).await {
            Ok(profile) => {
                debug!(%uuid, "Cached Minecraft token still valid");
                let skin_url = profile.active_skin_url().map(str::to_string);
                let result = LoginResult::success(
                    mc_token,
                    Some(new_refresh.to_string()),
                    profile.id,
                    profile.name,
                )
                .with_skin_url(skin_url);
                self.caches
                    .login_data
                    .insert(refresh_token.to_string(), result.clone());
                Some(result)
            }
            Err(e) => {
                debug!(%uuid, error = %e, "Cached Minecraft token rejected, running full chain");
                self.caches.mc.remove(uuid);
                None
            }
        }
    }

    pub fn clear_caches(&self) {
        self.caches.clear();
    }

    /// Forget the cached Minecraft token of one account
    pub fn clear_cache_for_account(&self, uuid: &str) {
        self.caches.mc.remove(uuid);
    }
}

fn hop_failed(
    hop: Hop,
    account_uuid: Option<&str>,
    error: &AuthError,
    new_refresh_token: Option<String>,
) -> LoginResult {
    warn!(%hop, account = ?account_uuid, %error, "login hop failed");
    LoginResult::failed(LoginFailure::Upstream { hop }, new_refresh_token)
}
