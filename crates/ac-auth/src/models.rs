use serde::{Deserialize, Serialize};

/// Microsoft OAuth token response (from both code and refresh_token grants)
#[derive(Debug, Clone, Deserialize)]
pub struct MsTokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

/// Xbox Live user.authenticate request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct XblAuthRequest {
    pub properties: XblAuthProperties,
    pub relying_party: String,
    pub token_type: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct XblAuthProperties {
    pub auth_method: String,
    pub site_name: String,
    pub rps_ticket: String,
}

/// XSTS authorize request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct XstsAuthRequest {
    pub properties: XstsAuthProperties,
    pub relying_party: String,
    pub token_type: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct XstsAuthProperties {
    pub sandbox_id: String,
    pub user_tokens: Vec<String>,
}

/// Response shape shared by user.authenticate and xsts/authorize
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct XboxTokenResponse {
    pub token: String,
    pub display_claims: XblDisplayClaims,
    #[serde(default)]
    pub not_after: Option<String>,
}

impl XboxTokenResponse {
    /// User hash of the first display claim
    pub fn user_hash(&self) -> Option<&str> {
        self.display_claims.xui.first().map(|claim| claim.uhs.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct XblDisplayClaims {
    #[serde(default)]
    pub xui: Vec<XblUserInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct XblUserInfo {
    pub uhs: String,
}

/// XSTS error response
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct XstsErrorResponse {
    #[serde(rename = "XErr")]
    pub xerr: u64,
    #[serde(default)]
    pub message: Option<String>,
}

/// Minecraft login_with_xbox request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct McLoginRequest {
    pub identity_token: String,
}

/// Minecraft login_with_xbox response
#[derive(Debug, Clone, Deserialize)]
pub struct McLoginResponse {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// Minecraft store entitlements
#[derive(Debug, Clone, Deserialize)]
pub struct EntitlementsResponse {
    #[serde(default)]
    pub items: Vec<Entitlement>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Entitlement {
    pub name: String,
}

impl EntitlementsResponse {
    pub const PRODUCT: &'static str = "product_minecraft";
    pub const GAME: &'static str = "game_minecraft";

    /// Both the product and the game entitlement must be present
    pub fn has_game_ownership(&self) -> bool {
        let has = |name: &str| self.items.iter().any(|item| item.name == name);
        has(Self::PRODUCT) && has(Self::GAME)
    }
}

/// Minecraft profile response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct McProfile {
    /// UUID without dashes
    pub id: String,
    /// Player name
    pub name: String,
    #[serde(default)]
    pub skins: Vec<McSkin>,
}

impl McProfile {
    /// Texture URL of the skin currently worn, used for the account head
    pub fn active_skin_url(&self) -> Option<&str> {
        self.skins
            .iter()
            .find(|skin| skin.state.eq_ignore_ascii_case("ACTIVE"))
            .or_else(|| self.skins.first())
            .map(|skin| skin.url.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct McSkin {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub state: String,
    pub url: String,
    #[serde(default)]
    pub variant: Option<String>,
}
