use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::ValueEnum;
use reqwest::header::{HeaderMap, COOKIE, SET_COOKIE};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error};

use crate::error::{AuthErrorCode, VbetError};

const USER_AGENT: &str = "[vbet player: 1.0]";
const LOGIN_RETRY: Duration = Duration::from_secs(30);
const MOZZART_FINGERPRINT: &str = "a39ad90130543e3547bf7b2bda9369";

/// Which bookmaker front-end issues the login and online-hash calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiBackend {
    Betika,
    Mozzart,
}

/// What a successful password login yields. Cached per user so later
/// starts can skip the password round-trip.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub unit_id: u64,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub cookie: Option<String>,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Password login. Fails with [`VbetError::InvalidUserAuthentication`]
    /// when the bookmaker rejects the credentials.
    async fn login(&self, username: &str, password: &str) -> Result<Credentials>;

    /// Fetch the one-time hash the socket presents in its login frame.
    async fn login_hash(&self, username: &str, credentials: &Credentials) -> Result<String>;
}

/// HTTPS implementation against the bookmaker sites.
#[derive(Clone)]
pub struct HttpAuthenticator {
    http: Client,
    backend: ApiBackend,
}

impl HttpAuthenticator {
    pub fn new(backend: ApiBackend) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(15))
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(HttpAuthenticator { http, backend })
    }

    fn login_url(&self) -> &'static str {
        match self.backend {
            ApiBackend::Betika => "https://api.betika.com/v1/login",
            ApiBackend::Mozzart => "https://www.mozzartbet.co.ke/auth",
        }
    }

    fn hash_url(&self) -> &'static str {
        match self.backend {
            ApiBackend::Betika => "https://api-golden-race.betika.com/betikagr/Login",
            ApiBackend::Mozzart => "https://www.mozzartbet.co.ke/golden-race-me",
        }
    }

    fn login_payload(&self, username: &str, password: &str) -> Value {
        match self.backend {
            ApiBackend::Betika => json!({
                "mobile": username,
                "password": password,
                "remember": true,
                "src": "DESKTOP",
            }),
            ApiBackend::Mozzart => json!({
                "fingerprint": MOZZART_FINGERPRINT,
                "isCasinoPage": false,
                "password": password,
                "username": username,
            }),
        }
    }
}

#[async_trait]
impl Authenticator for HttpAuthenticator {
    async fn login(&self, username: &str, password: &str) -> Result<Credentials> {
        let payload = self.login_payload(username, password);
        loop {
            let resp = match self.http.post(self.login_url()).json(&payload).send().await {
                Ok(resp) => resp,
                Err(e) if e.is_connect() || e.is_timeout() => {
                    error!("[{}] login user timeout {}", username, e);
                    tokio::time::sleep(LOGIN_RETRY).await;
                    continue;
                }
                Err(e) => return Err(e).context("Login request failed"),
            };

            let status = resp.status();
            let cookie = session_cookie(resp.headers());
            let body: Value = resp.json().await.unwrap_or(Value::Null);
            debug!("[{}] login response {}", username, status);

            if !status.is_success() {
                return Err(VbetError::InvalidUserAuthentication {
                    username: username.to_string(),
                    code: AuthErrorCode::InvalidCredentials,
                }
                .into());
            }
            return parse_login(self.backend, &body, cookie).ok_or_else(|| {
                VbetError::InvalidUserAuthentication {
                    username: username.to_string(),
                    code: AuthErrorCode::UnknownError,
                }
                .into()
            });
        }
    }

    async fn login_hash(&self, username: &str, credentials: &Credentials) -> Result<String> {
        let request = match self.backend {
            ApiBackend::Betika => self
                .http
                .post(self.hash_url())
                .json(&json!({ "profile_id": credentials.unit_id })),
            ApiBackend::Mozzart => {
                let request = self.http.get(self.hash_url());
                match &credentials.cookie {
                    Some(cookie) => request.header(COOKIE, cookie),
                    None => request,
                }
            }
        };

        let resp = request.send().await.context("Hash request failed")?;
        let status = resp.status();
        // betika answers with `text/json`, so skip content-type checks
        let body: Value = resp.json().await.unwrap_or(Value::Null);

        match body.get("onlineHash").and_then(|v| v.as_str()) {
            Some(hash) if status.is_success() && !hash.is_empty() => Ok(hash.to_string()),
            _ => Err(VbetError::InvalidUserHash {
                username: username.to_string(),
                status: status.as_u16(),
                message: body.to_string(),
            }
            .into()),
        }
    }
}

/// Pull the unit id (and token, for betika) out of a login response body.
fn parse_login(backend: ApiBackend, body: &Value, cookie: Option<String>) -> Option<Credentials> {
    match backend {
        ApiBackend::Betika => {
            let token = body.get("token").and_then(|v| v.as_str()).filter(|t| !t.is_empty())?;
            let unit_id = body
                .get("data")
                .and_then(|d| d.get("user"))
                .and_then(|u| u.get("id"))
                .and_then(as_id)?;
            Some(Credentials {
                unit_id,
                token: Some(token.to_string()),
                cookie,
            })
        }
        ApiBackend::Mozzart => {
            let ok = body.get("status").map(truthy).unwrap_or(false);
            if !ok {
                return None;
            }
            let unit_id = body
                .get("user")
                .and_then(|u| u.get("userId"))
                .and_then(as_id)?;
            Some(Credentials {
                unit_id,
                token: None,
                cookie,
            })
        }
    }
}

fn as_id(v: &Value) -> Option<u64> {
    v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        _ => true,
    }
}

/// `name=value` pairs from every `Set-Cookie` header, joined for a `Cookie` header.
fn session_cookie(headers: &HeaderMap) -> Option<String> {
    let pairs: Vec<&str> = headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|h| h.to_str().ok())
        .filter_map(|h| h.split(';').next())
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    if pairs.is_empty() {
        None
    } else {
        Some(pairs.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn betika_login_needs_token_and_user_id() {
        let body = json!({"token": "abc", "data": {"user": {"id": "4411"}}});
        let creds = parse_login(ApiBackend::Betika, &body, None).unwrap();
        assert_eq!(creds.unit_id, 4411);
        assert_eq!(creds.token.as_deref(), Some("abc"));

        let no_token = json!({"data": {"user": {"id": 4411}}});
        assert!(parse_login(ApiBackend::Betika, &no_token, None).is_none());
    }

    #[test]
    fn mozzart_login_keeps_session_cookie() {
        let body = json!({"status": "OK", "user": {"userId": 77}});
        let creds = parse_login(ApiBackend::Mozzart, &body, Some("sid=1".into())).unwrap();
        assert_eq!(creds.unit_id, 77);
        assert!(creds.token.is_none());
        assert_eq!(creds.cookie.as_deref(), Some("sid=1"));

        let rejected = json!({"status": false, "user": {"userId": 77}});
        assert!(parse_login(ApiBackend::Mozzart, &rejected, None).is_none());
    }

    #[test]
    fn set_cookie_headers_are_joined() {
        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_static("sid=1; Path=/; HttpOnly"));
        headers.append(SET_COOKIE, HeaderValue::from_static("lang=en; Path=/"));
        assert_eq!(session_cookie(&headers).as_deref(), Some("sid=1; lang=en"));
        assert!(session_cookie(&HeaderMap::new()).is_none());
    }
}
