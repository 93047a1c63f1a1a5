//! HTTP auth service: credential exchange and identity fetch over the REST API.

use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;

use super::{AuthError, AuthService, Credentials, User};

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
}

pub struct HttpAuthService {
    client: reqwest::Client,
    api_url: String,
}

impl HttpAuthService {
    /// Build a client for the API at `api_url`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Network`] if the HTTP client cannot be built.
    pub fn new(api_url: impl Into<String>, timeout: Duration) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuthError::Network(e.to_string()))?;
        Ok(Self { client, api_url: api_url.into().trim_end_matches('/').to_owned() })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.api_url)
    }
}

fn network(e: reqwest::Error) -> AuthError {
    AuthError::Network(e.to_string())
}

#[async_trait::async_trait]
impl AuthService for HttpAuthService {
    async fn exchange_credentials(&self, credentials: &Credentials) -> Result<String, AuthError> {
        let resp = self
            .client
            .post(self.url("/api/auth/login"))
            .json(credentials)
            .send()
            .await
            .map_err(network)?;

        match resp.status() {
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(AuthError::InvalidCredentials);
            }
            s if !s.is_success() => return Err(AuthError::Network(format!("login returned HTTP {}", s.as_u16()))),
            _ => {}
        }

        let body = resp.text().await.map_err(network)?;
        let login: LoginResponse = serde_json::from_str(&body)
            .map_err(|_| AuthError::Network(format!("unexpected login response: {body}")))?;
        Ok(login.token)
    }

    async fn fetch_current_user(&self, token: &str) -> Result<User, AuthError> {
        let resp = self
            .client
            .get(self.url("/api/auth/me"))
            .bearer_auth(token)
            .send()
            .await
            .map_err(network)?;

        match resp.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => return Err(AuthError::TokenExpired),
            s if !s.is_success() => return Err(AuthError::Network(format!("me returned HTTP {}", s.as_u16()))),
            _ => {}
        }

        resp.json::<User>().await.map_err(network)
    }

    async fn revoke(&self, token: &str) -> Result<(), AuthError> {
        let resp = self
            .client
            .post(self.url("/api/auth/logout"))
            .bearer_auth(token)
            .send()
            .await
            .map_err(network)?;
        let status = resp.status();
        // An already-invalid token is as revoked as it gets.
        if status.is_success() || status == StatusCode::UNAUTHORIZED {
            Ok(())
        } else {
            Err(AuthError::Network(format!("logout returned HTTP {}", status.as_u16())))
        }
    }
}

#[cfg(test)]
#[path = "http_test.rs"]
mod tests;
