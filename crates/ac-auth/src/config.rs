use std::time::Duration;

/// Microsoft, Xbox Live and Minecraft Services endpoints
pub mod endpoints {
    pub const MS_AUTHORIZE: &str = "https://login.live.com/oauth20_authorize.srf";
    pub const MS_TOKEN: &str = "https://login.live.com/oauth20_token.srf";
    pub const XBL_AUTHENTICATE: &str = "https://user.auth.xboxlive.com/user/authenticate";
    pub const XSTS_AUTHORIZE: &str = "https://xsts.auth.xboxlive.com/xsts/authorize";
    pub const MC_LOGIN: &str = "https://api.minecraftservices.com/authentication/login_with_xbox";
    pub const MC_ENTITLEMENTS: &str = "https://api.minecraftservices.com/entitlements/mcstore";
    pub const MC_PROFILE: &str = "https://api.minecraftservices.com/minecraft/profile";
}

/// Public client registered for the loopback redirect on [`REDIRECT_PORT`]
pub const CLIENT_ID: &str = "4673b348-3efa-4f6a-bbb6-34e141cdc638";
pub const REDIRECT_PORT: u16 = 9675;
pub const SCOPE: &str = "XboxLive.signin offline_access";

/// Relying parties
pub const RP_XBOXLIVE_AUTH: &str = "http://auth.xboxlive.com";
pub const RP_MINECRAFT: &str = "rp://api.minecraftservices.com/";

/// Full set of upstream URLs used by the chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub ms_authorize: String,
    pub ms_token: String,
    pub xbl_authenticate: String,
    pub xsts_authorize: String,
    pub mc_login: String,
    pub mc_entitlements: String,
    pub mc_profile: String,
}

impl Endpoints {
    /// Point every endpoint at a single host, keeping the upstream paths.
    ///
    /// Used to run the chain against a local mock server.
    pub fn with_base(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            ms_authorize: format!("{base}/oauth20_authorize.srf"),
            ms_token: format!("{base}/oauth20_token.srf"),
            xbl_authenticate: format!("{base}/user/authenticate"),
            xsts_authorize: format!("{base}/xsts/authorize"),
            mc_login: format!("{base}/authentication/login_with_xbox"),
            mc_entitlements: format!("{base}/entitlements/mcstore"),
            mc_profile: format!("{base}/minecraft/profile"),
        }
    }
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            ms_authorize: endpoints::MS_AUTHORIZE.to_string(),
            ms_token: endpoints::MS_TOKEN.to_string(),
            xbl_authenticate: endpoints::XBL_AUTHENTICATE.to_string(),
            xsts_authorize: endpoints::XSTS_AUTHORIZE.to_string(),
            mc_login: endpoints::MC_LOGIN.to_string(),
            mc_entitlements: endpoints::MC_ENTITLEMENTS.to_string(),
            mc_profile: endpoints::MC_PROFILE.to_string(),
        }
    }
}

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpTimeouts {
    pub connect: Duration,
    pub request: Duration,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(15),
            request: Duration::from_secs(30),
        }
    }
}

/// Lifetimes of the three chain caches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheTtls {
    /// Full login results keyed by the presented refresh token.
    /// Minecraft tokens live 24h, so stay an hour under that.
    pub login_data: Duration,
    /// XBL token + user hash keyed by Microsoft access token
    pub xbl: Duration,
    /// Minecraft access token keyed by account uuid
    pub mc: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            login_data: Duration::from_secs(23 * 60 * 60),
            xbl: Duration::from_secs(12 * 60 * 60),
            mc: Duration::from_secs(23 * 60 * 60),
        }
    }
}

/// Configuration for [`LoginChain`](crate::LoginChain)
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// OAuth client ID
    pub client_id: String,

    /// Loopback port the redirect listener binds to
    pub redirect_port: u16,

    /// OAuth scope requested at authorization and refresh
    pub scope: String,

    /// Upstream URLs
    pub endpoints: Endpoints,

    /// HTTP client timeouts
    pub http_timeouts: HttpTimeouts,

    /// Custom user agent (optional)
    pub user_agent: Option<String>,

    /// Cache lifetimes
    pub cache_ttls: CacheTtls,
}

impl AuthConfig {
    /// Redirect URI registered for the client, `http://127.0.0.1:<port>`
    pub fn redirect_uri(&self) -> String {
        format!("http://127.0.0.1:{}", self.redirect_port)
    }

    /// Same configuration with every endpoint rooted at `base`
    pub fn with_base_url(mut self, base: &str) -> Self {
        self.endpoints = Endpoints::with_base(base);
        self
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            client_id: CLIENT_ID.to_string(),
            redirect_port: REDIRECT_PORT,
            scope: SCOPE.to_string(),
            endpoints: Endpoints::default(),
            http_timeouts: HttpTimeouts::default(),
            user_agent: Some("authchain-mc".to_string()),
            cache_ttls: CacheTtls::default(),
        }
    }
}
