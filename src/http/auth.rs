use base64::Engine;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    /// `Authorization: Basic ...`
    #[default]
    Header,
    /// `login` / `api_key` query parameters.
    Params,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub api_key: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("api_key", &mask_api_key(&self.api_key, 4))
            .finish()
    }
}

impl Credentials {
    pub fn is_valid(&self) -> bool {
        !self.username.is_empty() && !self.api_key.is_empty()
    }

    pub fn to_basic_auth(&self) -> String {
        let raw = format!("{}:{}", self.username, self.api_key);
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(raw.as_bytes())
        )
    }
}

/// Holds the account used for authenticated calls. Credentials are only
/// replaced by an explicit `set_credentials`.
#[derive(Debug, Default)]
pub struct AuthManager {
    credentials: RwLock<Option<Credentials>>,
}

impl AuthManager {
    pub fn new(username: &str, api_key: &str) -> Self {
        let manager = Self::default();
        manager.set_credentials(username, api_key);
        manager
    }

    pub fn is_authenticated(&self) -> bool {
        self.credentials()
            .map(|c| c.is_valid())
            .unwrap_or(false)
    }

    pub fn credentials(&self) -> Option<Credentials> {
        self.credentials.read().ok().and_then(|c| c.clone())
    }

    /// Returns false (and keeps the previous credentials) when either part is empty.
    pub fn set_credentials(&self, username: &str, api_key: &str) -> bool {
        if username.is_empty() || api_key.is_empty() {
            return false;
        }
        match self.credentials.write() {
            Ok(mut slot) => {
                *slot = Some(Credentials {
                    username: username.to_string(),
                    api_key: api_key.to_string(),
                });
                true
            }
            Err(_) => false,
        }
    }

    pub fn clear_credentials(&self) {
        if let Ok(mut slot) = self.credentials.write() {
            *slot = None;
        }
    }

    /// Add credentials to an outgoing request. No-op when not authenticated.
    pub fn apply_auth(
        &self,
        headers: &mut HeaderMap,
        params: &mut BTreeMap<String, String>,
        method: AuthMethod,
    ) {
        let Some(creds) = self.credentials().filter(|c| c.is_valid()) else {
            return;
        };
        match method {
            AuthMethod::Header => {
                if let Ok(value) = HeaderValue::from_str(&creds.to_basic_auth()) {
                    headers.insert(AUTHORIZATION, value);
                }
            }
            AuthMethod::Params => {
                params.insert("login".into(), creds.username);
                params.insert("api_key".into(), creds.api_key);
            }
        }
    }

    /// Format check only; the server is never contacted.
    pub fn validate_credentials(&self) -> Result<(), String> {
        let Some(creds) = self.credentials() else {
            return Err("no credentials configured".into());
        };
        if creds.username.is_empty() {
            return Err("username must not be empty".into());
        }
        if creds.api_key.is_empty() {
            return Err("api key must not be empty".into());
        }
        if creds.api_key.len() < 20 {
            return Err("api key looks too short".into());
        }
        Ok(())
    }
}

/// Keep `visible` characters at each end of the key, star the rest.
pub fn mask_api_key(api_key: &str, visible: usize) -> String {
    let chars: Vec<char> = api_key.chars().collect();
    if chars.len() <= visible * 2 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..visible].iter().collect();
    let tail: String = chars[chars.len() - visible..].iter().collect();
    format!("{}{}{}", head, "*".repeat(chars.len() - visible * 2), tail)
}
