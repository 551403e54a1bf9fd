use ac_auth::{AuthConfig, LoginChain, LoginFailure};
use serde_json::json;
use wiremock::matchers::{body_json, body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mount_chain(server: &MockServer, mc_login: ResponseTemplate, expected_logins: u64) {
    Mock::given(method("POST"))
        .and(path("/oauth20_token.srf"))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "ms-at",
            "refresh_token": "rt-rotated",
            "expires_in": 3600,
        })))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/user/authenticate"))
        .and(body_json(json!({
            "Properties": {
                "AuthMethod": "RPS",
                "SiteName": "user.auth.xboxlive.com",
                "RpsTicket": "d=ms-at",
            },
            "RelyingParty": "http://auth.xboxlive.com",
            "TokenType": "JWT",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "Token": "xbl",
            "DisplayClaims": { "xui": [{ "uhs": "1234" }] },
        })))
        .expect(1)
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/xsts/authorize"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "Token": "xsts",
            "DisplayClaims": { "xui": [{ "uhs": "1234" }] },
        })))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/authentication/login_with_xbox"))
        .and(body_json(json!({ "identityToken": "XBL3.0 x=1234;xsts" })))
        .respond_with(mc_login)
        .expect(expected_logins)
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/entitlements/mcstore"))
        .and(header("Authorization", "Bearer mc-at"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                { "name": "product_minecraft", "signature": "a" },
                { "name": "game_minecraft", "signature": "b" },
            ],
        })))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/minecraft/profile"))
        .and(header("Authorization", "Bearer mc-at"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "069a79f444e94726a5befca90e38aaf5",
            "name": "Notch",
            "skins": [{ "id": "s", "state": "ACTIVE", "url": "http://textures/skin", "variant": "CLASSIC" }],
        })))
        .mount(server)
        .await;
}

fn chain_for(server: &MockServer) -> LoginChain {
    LoginChain::new(AuthConfig::default().with_base_url(&server.uri())).unwrap()
}

#[tokio::test]
async fn login_over_http_runs_each_hop_once() {
    let server = MockServer::start().await;
    mount_chain(
        &server,
        ResponseTemplate::new(200).set_body_json(json!({
            "username": "ignored",
            "access_token": "mc-at",
            "token_type": "Bearer",
            "expires_in": 86400,
        })),
        1,
    )
    .await;

    let chain = chain_for(&server);
    let result = chain.login("rt-original", None).await;

    assert!(result.is_good());
    assert_eq!(result.mc_token(), Some("mc-at"));
    assert_eq!(result.new_refresh_token(), Some("rt-rotated"));
    assert_eq!(result.uuid(), Some("069a79f444e94726a5befca90e38aaf5"));
    assert_eq!(result.username(), Some("Notch"));

    // served from the login data cache
    let again = chain.login("rt-original", None).await;
    assert_eq!(again, result);
}

#[tokio::test]
async fn throttled_minecraft_login_is_reported_as_rate_limited() {
    let server = MockServer::start().await;
    mount_chain(
        &server,
        ResponseTemplate::new(429).set_body_string("Too Many Requests"),
        1,
    )
    .await;

    let result = chain_for(&server).login("rt-original", None).await;

    assert!(result.is_rate_limited());
    assert!(!result.is_good());
    assert_eq!(result.failure(), Some(LoginFailure::RateLimited));
    assert_eq!(result.new_refresh_token(), Some("rt-rotated"));
}

#[tokio::test]
async fn rejected_refresh_token_is_invalid_grant() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth20_token.srf"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant",
            "error_description": "The refresh token has expired.",
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/user/authenticate"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let result = chain_for(&server).login("rt-dead", None).await;

    assert_eq!(result.failure(), Some(LoginFailure::InvalidGrant));
    assert_eq!(result.new_refresh_token(), None);
}
