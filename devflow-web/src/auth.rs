use crate::error::WebError;
use chrono::Utc;
use devflow_config::ViewSection;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fs, path::Path, time::Duration};
use tracing::warn;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
}

/// Authentication state: htpasswd users plus the JWT signing secret.
pub struct AuthState {
    jwt_secret: Vec<u8>,
    validity: Duration,
    users: HashMap<String, String>,
}

impl AuthState {
    pub fn new(jwt_secret: &str, validity: Duration, htaccess_file: &Path) -> Result<Self, String> {
        let users = load_htpasswd(htaccess_file)?;
        Ok(Self {
            jwt_secret: jwt_secret.as_bytes().to_vec(),
            validity,
            users,
        })
    }

    /// Verify a login and mint a token for it.
    pub fn login(&self, user: &str, password: &str) -> Result<String, WebError> {
        let hash = self
            .users
            .get(user)
            .ok_or(WebError::Forbidden)?;
        let ok = if hash.starts_with("$2") {
            bcrypt::verify(password, hash).unwrap_or(false)
        } else {
            // plain htpasswd entries, useful for tests only
            hash == password
        };
        if !ok {
            return Err(WebError::Forbidden);
        }
        self.mint(user)
    }

    fn mint(&self, user: &str) -> Result<String, WebError> {
        let claims = Claims {
            sub: user.to_string(),
            exp: (Utc::now() + self.validity).timestamp(),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(&self.jwt_secret),
        )
        .map_err(|e| WebError::Internal(format!("cannot sign token: {e}")))
    }

    /// Validate a token and return the user it was minted for.
    pub fn check_token(&self, token: &str) -> Option<String> {
        decode::<Claims>(
            token,
            &DecodingKey::from_secret(&self.jwt_secret),
            &Validation::default(),
        )
        .map(|data| data.claims.sub)
        .ok()
    }
}

fn load_htpasswd(path: &Path) -> Result<HashMap<String, String>, String> {
    let text = fs::read_to_string(path)
        .map_err(|e| format!("cannot read htaccess file {}: {e}", path.to_string_lossy()))?;
    let mut users = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match line.split_once(':') {
            Some((user, hash)) => {
                users.insert(user.to_string(), hash.to_string());
            }
            None => warn!(line, "skipping malformed htaccess line"),
        }
    }
    Ok(users)
}

/// A view is open to everyone when its allow-list is empty; otherwise the
/// authenticated user must be listed.
pub fn view_allows_user(view: &ViewSection, user: Option<&str>) -> bool {
    if view.is_public() {
        return true;
    }
    match user {
        Some(user) => view.allowed_users.iter().any(|u| u == user),
        None => false,
    }
}
