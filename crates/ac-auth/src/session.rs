use std::fmt;

use chrono::{DateTime, Utc};

/// Microsoft OAuth tokens from a code or refresh grant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl MsTokens {
    pub fn new(access_token: String, refresh_token: String, expires_in: Option<u64>) -> Self {
        let expires_at =
            expires_in.map(|secs| Utc::now() + chrono::Duration::seconds(secs as i64));
        Self {
            access_token,
            refresh_token,
            expires_at,
        }
    }
}

/// Xbox Live token and the user hash needed for the Minecraft identity token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XblAuth {
    pub token: String,
    pub uhs: String,
}

/// One upstream request of the chain, used to label logs and failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hop {
    CodeExchange,
    TokenRefresh,
    XblAuth,
    XstsAuth,
    McLogin,
    Entitlements,
    Profile,
}

impl Hop {
    pub fn as_str(self) -> &'static str {
        match self {
            Hop::CodeExchange => "code_exchange",
            Hop::TokenRefresh => "token_refresh",
            Hop::XblAuth => "xbl_authenticate",
            Hop::XstsAuth => "xsts_authorize",
            Hop::McLogin => "login_with_xbox",
            Hop::Entitlements => "entitlements",
            Hop::Profile => "profile",
        }
    }
}

impl fmt::Display for Hop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a login did not produce a Minecraft token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginFailure {
    /// Null or unparseable response; retrying with the same inputs is safe
    Upstream { hop: Hop },
    /// The refresh token was rejected outright
    InvalidGrant,
    /// `login_with_xbox` refused the request; back off before retrying
    RateLimited,
    /// The account lacks the product or game entitlement
    NotOwned,
}

/// Outcome of [`LoginChain::login`](crate::LoginChain::login).
///
/// A result is "good" iff it carries a Minecraft token. Failed results may
/// still carry `new_refresh_token`: once the refresh grant succeeded the old
/// token is dead upstream, so callers must persist the rotated one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoginResult {
    mc_token: Option<String>,
    new_refresh_token: Option<String>,
    uuid: Option<String>,
    username: Option<String>,
    skin_url: Option<String>,
    rate_limited: bool,
    failure: Option<LoginFailure>,
}

impl LoginResult {
    pub fn success(
        mc_token: String,
        new_refresh_token: Option<String>,
        uuid: String,
        username: String,
    ) -> Self {
        Self {
            mc_token: Some(mc_token),
            new_refresh_token,
            uuid: Some(uuid),
            username: Some(username),
            skin_url: None,
            rate_limited: false,
            failure: None,
        }
    }

    /// Attach the texture of the skin the profile currently wears
    pub fn with_skin_url(mut self, skin_url: Option<String>) -> Self {
        self.skin_url = skin_url;
        self
    }

    pub fn failed(failure: LoginFailure, new_refresh_token: Option<String>) -> Self {
        Self {
            new_refresh_token,
            rate_limited: failure == LoginFailure::RateLimited,
            failure: Some(failure),
            ..Self::default()
        }
    }

    pub fn rate_limited(new_refresh_token: Option<String>) -> Self {
        Self::failed(LoginFailure::RateLimited, new_refresh_token)
    }

    pub fn is_good(&self) -> bool {
        self.mc_token.is_some()
    }

    pub fn is_rate_limited(&self) -> bool {
        self.rate_limited
    }

    /// Failures that retrying with the same account can never fix
    pub fn is_irrecoverable(&self) -> bool {
        matches!(
            self.failure,
            Some(LoginFailure::InvalidGrant | LoginFailure::NotOwned)
        )
    }

    pub fn mc_token(&self) -> Option<&str> {
        self.mc_token.as_deref()
    }

    pub fn new_refresh_token(&self) -> Option<&str> {
        self.new_refresh_token.as_deref()
    }

    pub fn uuid(&self) -> Option<&str> {
        self.uuid.as_deref()
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn skin_url(&self) -> Option<&str> {
        self.skin_url.as_deref()
    }

    pub fn failure(&self) -> Option<LoginFailure> {
        self.failure
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_good_iff_mc_token_present() {
        let ok = LoginResult::success(
            "mc".to_string(),
            Some("rt-2".to_string()),
            "uuid".to_string(),
            "Steve".to_string(),
        );
        assert!(ok.is_good());
        assert!(!ok.is_rate_limited());
        assert_eq!(ok.failure(), None);

        let empty = LoginResult::default();
        assert!(!empty.is_good());
        assert!(!empty.is_irrecoverable());
    }

    #[test]
    fn test_rate_limited_is_flagged_and_not_good() {
        let res = LoginResult::rate_limited(Some("rt-2".to_string()));
        assert!(res.is_rate_limited());
        assert!(!res.is_good());
        assert!(!res.is_irrecoverable());
        assert_eq!(res.new_refresh_token(), Some("rt-2"));
    }

    #[test]
    fn test_irrecoverable_failures() {
        assert!(LoginResult::failed(LoginFailure::NotOwned, None).is_irrecoverable());
        assert!(LoginResult::failed(LoginFailure::InvalidGrant, None).is_irrecoverable());
        assert!(
            !LoginResult::failed(LoginFailure::Upstream { hop: Hop::XstsAuth }, None)
                .is_irrecoverable()
        );
    }
}
