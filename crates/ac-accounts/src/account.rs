use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use ac_auth::{LoginChain, LoginResult, TokenCache};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::errors::AccountError;
use crate::inventory::InventoryClient;
use crate::picker::StopFlag;

type Result<T> = std::result::Result<T, AccountError>;

/// Lifetime of a Minecraft token resolved for an external account
pub const EXTERNAL_TOKEN_TTL: Duration = Duration::from_secs(23 * 60 * 60);

/// Profile data remembered between runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileCache {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub uuid: String,
    /// Skin texture the account head is drawn from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head: Option<String>,
}

/// Minecraft token and profile resolved for an external account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalToken {
    pub mc_token: String,
    pub username: String,
    pub uuid: String,
    pub head: Option<String>,
}

/// Everything an account needs to load itself
#[derive(Debug, Clone)]
pub struct AccountContext {
    pub chain: LoginChain,
    pub inventory: Option<InventoryClient>,
    /// Resolved external tokens keyed by inventory id
    pub external_tokens: Arc<TokenCache<String, ExternalToken>>,
}

impl AccountContext {
    pub fn new(chain: LoginChain, inventory: Option<InventoryClient>) -> Self {
        Self {
            chain,
            inventory,
            external_tokens: Arc::new(TokenCache::new("external", EXTERNAL_TOKEN_TTL)),
        }
    }

    /// Forget every cached token of an external account
    pub fn clear_external_cache(&self, id: &str) {
        if let Some(token) = self.external_tokens.remove(id) {
            self.chain.clear_cache_for_account(&token.uuid);
        }
    }

    pub fn clear_all_caches(&self) {
        self.external_tokens.clear();
        self.chain.clear_caches();
    }
}

/// What the game needs to join servers as this account
#[derive(Clone, PartialEq, Eq)]
pub struct GameSession {
    pub username: String,
    /// Undashed uuid
    pub uuid: String,
    pub access_token: String,
}

impl GameSession {
    pub const USER_TYPE: &'static str = "msa";

    fn new(cache: &ProfileCache, access_token: &str) -> Self {
        Self {
            username: cache.username.clone(),
            uuid: cache.uuid.replace('-', "").to_ascii_lowercase(),
            access_token: access_token.to_string(),
        }
    }
}

impl fmt::Debug for GameSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GameSession")
            .field("username", &self.username)
            .field("uuid", &self.uuid)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

/// Account identified by a Microsoft refresh token
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshTokenAccount {
    pub refresh_token: String,
    #[serde(default)]
    pub cache: ProfileCache,
    #[serde(skip)]
    mc_token: Option<String>,
}

impl RefreshTokenAccount {
    pub fn new(refresh_token: impl Into<String>) -> Self {
        Self {
            refresh_token: refresh_token.into(),
            ..Self::default()
        }
    }

    #[instrument(skip(self, ctx), fields(uuid = %self.cache.uuid))]
    async fn fetch_info(&mut self, ctx: &AccountContext) -> Result<()> {
        let known_uuid = Some(self.cache.uuid.as_str()).filter(|uuid| !uuid.is_empty());
        let result = ctx.chain.login(&self.refresh_token, known_uuid).await;

        // upstream has rotated the token even if a later hop failed
        if let Some(rotated) = result.new_refresh_token() {
            self.refresh_token = rotated.to_string();
        }

        let mc_token = apply_login(&mut self.cache, &result)?;
        self.mc_token = Some(mc_token);
        Ok(())
    }
}

/// Account identified by a Minecraft access token obtained elsewhere.
///
/// The token is used as is until it expires upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTokenAccount {
    pub token: String,
    #[serde(default)]
    pub cache: ProfileCache,
    #[serde(skip)]
    loaded: bool,
}

impl SessionTokenAccount {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            ..Self::default()
        }
    }

    #[instrument(skip(self, ctx))]
    async fn fetch_info(&mut self, ctx: &AccountContext) -> Result<()> {
        let profile = ctx
            .chain
            .fetch_profile(&self.token)
            .await
            .map_err(AccountError::Profile)?;

        self.cache.head = profile.active_skin_url().map(str::to_string);
        self.cache.username = profile.name;
        self.cache.uuid = profile.id;
        self.loaded = true;
        Ok(())
    }
}

/// How an external account's inventory id becomes a Minecraft token
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExternalStrategy {
    /// Fetch the account's Microsoft refresh token and run the login chain
    #[default]
    RefreshChain,
    /// Ask the inventory for a ready Minecraft token; no rotation involved
    DerivedAccessToken,
}

/// Account held by the external inventory, identified by its inventory id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalAccount {
    pub id: String,
    #[serde(default)]
    pub strategy: ExternalStrategy,
    #[serde(default)]
    pub cache: ProfileCache,
    #[serde(skip)]
    mc_token: Option<String>,
}

impl ExternalAccount {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn with_strategy(mut self, strategy: ExternalStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Load the account, giving up with [`AccountError::Stopped`] if `stop`
    /// is raised between the inventory lookup and the login chain
    #[instrument(skip(self, ctx, stop), fields(id = %self.id))]
    pub async fn fetch_info_until(&mut self, ctx: &AccountContext, stop: &StopFlag) -> Result<()> {
        if self.mc_token.is_some() {
            return Ok(());
        }
        self.load(ctx, Some(stop)).await
    }

    async fn load(&mut self, ctx: &AccountContext, stop: Option<&StopFlag>) -> Result<()> {
        if let Some(cached) = ctx.external_tokens.get(&self.id) {
            info!(username = %cached.username, uuid = %cached.uuid, "Using cached token");
            self.apply(cached);
            return Ok(());
        }

        let inventory = ctx
            .inventory
            .as_ref()
            .ok_or(AccountError::MissingInventory)?;

        let token = match self.strategy {
            ExternalStrategy::RefreshChain => self.login_with_chain(ctx, inventory, stop).await?,
            ExternalStrategy::DerivedAccessToken => derived_token(ctx, inventory, &self.id).await?,
        };

        info!(username = %token.username, uuid = %token.uuid, "Authenticated");
        ctx.external_tokens.insert(self.id.clone(), token.clone());
        self.apply(token);
        Ok(())
    }

    async fn login_with_chain(
        &self,
        ctx: &AccountContext,
        inventory: &InventoryClient,
        stop: Option<&StopFlag>,
    ) -> Result<ExternalToken> {
        let record = inventory.account(&self.id).await?;
        if stop.is_some_and(StopFlag::is_stopped) {
            return Err(AccountError::Stopped);
        }

        let result = ctx
            .chain
            .login(&record.msa_refresh_token, record.mcuuid.as_deref())
            .await;

        let mut cache = ProfileCache::default();
        match apply_login(&mut cache, &result) {
            Ok(mc_token) => Ok(ExternalToken {
                mc_token,
                username: cache.username,
                uuid: cache.uuid,
                head: cache.head,
            }),
            Err(e) if e.is_irrecoverable() => {
                warn!(error = %e, "Account is unusable, removing it from the inventory");
                ctx.external_tokens.remove(&self.id);
                if let Err(delete_error) = inventory.delete_account(&self.id).await {
                    warn!(error = %delete_error, "Failed to delete inventory account");
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn apply(&mut self, token: ExternalToken) {
        self.cache.username = token.username;
        self.cache.uuid = token.uuid;
        self.cache.head = token.head;
        self.mc_token = Some(token.mc_token);
    }
}

async fn derived_token(
    ctx: &AccountContext,
    inventory: &InventoryClient,
    id: &str,
) -> Result<ExternalToken> {
    let derived = inventory.access_token(id).await?;
    let mc_token = derived
        .access_token
        .ok_or(crate::errors::InventoryError::MissingField("access_token"))?;

    // the inventory does not report skins
    let head = match ctx.chain.fetch_profile(&mc_token).await {
        Ok(profile) => profile.active_skin_url().map(str::to_string),
        Err(e) => {
            warn!(error = %e, "Failed to fetch profile for the account head");
            None
        }
    };

    Ok(ExternalToken {
        mc_token,
        username: derived.username.unwrap_or_default(),
        uuid: derived.uuid.unwrap_or_default(),
        head,
    })
}

/// Copy a good login into `cache`, returning its Minecraft token
fn apply_login(cache: &mut ProfileCache, result: &LoginResult) -> Result<String> {
    let Some(mc_token) = result.mc_token() else {
        return Err(AccountError::from_failure(result.failure()));
    };

    cache.username = result.username().unwrap_or_default().to_string();
    cache.uuid = result.uuid().unwrap_or_default().to_string();
    cache.head = result.skin_url().map(str::to_string);
    Ok(mc_token.to_string())
}

/// Discriminant of [`Account`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountKind {
    RefreshToken,
    SessionToken,
    External,
}

impl fmt::Display for AccountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            AccountKind::RefreshToken => "refresh-token",
            AccountKind::SessionToken => "session-token",
            AccountKind::External => "external",
        })
    }
}

/// A Minecraft account in one of its three forms.
///
/// Loading is lazy: [`fetch_info`](Self::fetch_info) resolves the profile
/// and a Minecraft token once; later calls return immediately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Account {
    RefreshToken(RefreshTokenAccount),
    SessionToken(SessionTokenAccount),
    External(ExternalAccount),
}

impl Account {
    pub fn kind(&self) -> AccountKind {
        match self {
            Account::RefreshToken(_) => AccountKind::RefreshToken,
            Account::SessionToken(_) => AccountKind::SessionToken,
            Account::External(_) => AccountKind::External,
        }
    }

    /// Refresh token, session token, or inventory id
    pub fn identity(&self) -> &str {
        match self {
            Account::RefreshToken(account) => &account.refresh_token,
            Account::SessionToken(account) => &account.token,
            Account::External(account) => &account.id,
        }
    }

    pub fn cache(&self) -> &ProfileCache {
        match self {
            Account::RefreshToken(account) => &account.cache,
            Account::SessionToken(account) => &account.cache,
            Account::External(account) => &account.cache,
        }
    }

    pub fn username(&self) -> &str {
        &self.cache().username
    }

    pub fn uuid(&self) -> &str {
        &self.cache().uuid
    }

    fn mc_token(&self) -> Option<&str> {
        match self {
            Account::RefreshToken(account) => account.mc_token.as_deref(),
            Account::SessionToken(account) => account.loaded.then_some(account.token.as_str()),
            Account::External(account) => account.mc_token.as_deref(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.mc_token().is_some()
    }

    /// Whether an account whose first load failed with `error` should still
    /// be saved. A refresh-token account may hold the only copy of a rotated
    /// token, which stays usable unless the failure is irrecoverable.
    pub fn keep_after_failed_load(&self, error: &AccountError) -> bool {
        matches!(self, Account::RefreshToken(_)) && !error.is_irrecoverable()
    }

    /// Resolve the profile and a Minecraft token; a no-op once loaded
    pub async fn fetch_info(&mut self, ctx: &AccountContext) -> Result<()> {
        if self.is_loaded() {
            return Ok(());
        }

        match self {
            Account::RefreshToken(account) => account.fetch_info(ctx).await,
            Account::SessionToken(account) => account.fetch_info(ctx).await,
            Account::External(account) => account.load(ctx, None).await,
        }
    }

    /// Build a game session, loading the account first if needed
    pub async fn login(&mut self, ctx: &AccountContext) -> Result<GameSession> {
        self.fetch_info(ctx).await?;

        let token = self.mc_token().ok_or(AccountError::Upstream {
            hop: ac_auth::Hop::McLogin,
        })?;
        let session = GameSession::new(self.cache(), token);
        info!(username = %session.username, kind = %self.kind(), "Session ready");
        Ok(session)
    }
}

impl From<RefreshTokenAccount> for Account {
    fn from(account: RefreshTokenAccount) -> Self {
        Account::RefreshToken(account)
    }
}

impl From<SessionTokenAccount> for Account {
    fn from(account: SessionTokenAccount) -> Self {
        Account::SessionToken(account)
    }
}

impl From<ExternalAccount> for Account {
    fn from(account: ExternalAccount) -> Self {
        Account::External(account)
    }
}
