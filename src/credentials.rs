use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use base64::Engine;
use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::{header, Client};
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info};

use crate::error::AuthError;
use crate::models::TokenResponse;
use crate::settings::SpotifyCredentials;

/// A bearer token together with the instant it stops being usable.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    token: String,
    expires_at: Instant,
}

impl Credential {
    pub fn new(token: impl Into<String>, expires_at: Instant) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    /// Build a credential from a provider TTL, shortened by `safety_factor`
    /// to absorb clock skew and request latency.
    pub fn from_grant(grant: &TokenGrant, safety_factor: f64) -> Self {
        let ttl = grant.expires_in.mul_f64(safety_factor.clamp(0.0, 1.0));
        Self::new(grant.access_token.clone(), Instant::now() + ttl)
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn time_to_live(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    pub(crate) fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let preview = self.token.chars().take(4).collect::<String>();
        f.debug_struct("Credential")
            .field("token", &format!("{}…", preview))
            .field("time_to_live", &self.time_to_live())
            .finish()
    }
}

/// Raw result of a token exchange, before the safety factor is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    pub expires_in: Duration,
}

/// Performs one refresh exchange against the provider.
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    async fn exchange(&self) -> Result<TokenGrant, AuthError>;
}

/// Refresh-token grant authenticated with the client id and secret.
pub struct RefreshTokenExchanger {
    client: Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    // Replaced when the provider rotates the refresh token.
    refresh_token: Mutex<String>,
}

impl RefreshTokenExchanger {
    pub fn new(client: Client, accounts_base: &str, credentials: &SpotifyCredentials) -> Self {
        Self {
            client,
            token_url: format!("{}/api/token", accounts_base.trim_end_matches('/')),
            client_id: credentials.client_id.clone(),
            client_secret: credentials.client_secret.clone(),
            refresh_token: Mutex::new(credentials.refresh_token.clone()),
        }
    }

    fn basic_auth(&self) -> String {
        let raw = format!("{}:{}", self.client_id, self.client_secret);
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(raw)
        )
    }

    fn current_refresh_token(&self) -> String {
        self.refresh_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl TokenExchanger for RefreshTokenExchanger {
    async fn exchange(&self) -> Result<TokenGrant, AuthError> {
        let refresh_token = self.current_refresh_token();
        let form_fields = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
        ];
        let form_data = serde_urlencoded::to_string(form_fields)
            .map_err(|e| AuthError::Request(e.to_string()))?;

        debug!(url = %self.token_url, "Requesting access token");
        let response = self
            .client
            .post(&self.token_url)
            .header(header::AUTHORIZATION, self.basic_auth())
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(form_data)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = status.as_u16(), %body, "Token exchange rejected");
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.text().await?;
        let token: TokenResponse =
            serde_json::from_str(&body).map_err(|e| AuthError::InvalidResponse(e.to_string()))?;
        if token.access_token.is_empty() {
            return Err(AuthError::InvalidResponse(
                "Empty access_token".to_string(),
            ));
        }

        if let Some(rotated) = token.refresh_token.filter(|t| !t.is_empty()) {
            debug!("Provider rotated the refresh token");
            *self
                .refresh_token
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = rotated;
        }

        Ok(TokenGrant {
            access_token: token.access_token,
            expires_in: Duration::from_secs(token.expires_in),
        })
    }
}

type RefreshFuture = Shared<BoxFuture<'static, Result<Credential, AuthError>>>;

#[derive(Default)]
struct CacheState {
    credential: Option<Credential>,
    in_flight: Option<RefreshFuture>,
}

/// Caches the bearer credential and coalesces refreshes.
///
/// Cloning is cheap and every clone shares the same cache, so one
/// credential can serve several consumers.
#[derive(Clone)]
pub struct CredentialCache {
    exchanger: Arc<dyn TokenExchanger>,
    safety_factor: f64,
    state: Arc<Mutex<CacheState>>,
}

impl CredentialCache {
    pub fn new(exchanger: Arc<dyn TokenExchanger>, safety_factor: f64) -> Self {
        Self {
            exchanger,
            safety_factor,
            state: Arc::new(Mutex::new(CacheState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the cached credential, refreshing it first if it has expired.
    ///
    /// Callers arriving while a refresh is already running wait for that
    /// refresh and receive its result, success or failure.
    pub async fn get_token(&self) -> Result<Credential, AuthError> {
        let refresh = {
            let mut state = self.lock();
            if let Some(credential) = state.credential.as_ref().filter(|c| !c.is_expired()) {
                return Ok(credential.clone());
            }
            match state.in_flight.as_ref() {
                Some(in_flight) => {
                    debug!("Joining in-flight token refresh");
                    in_flight.clone()
                }
                None => {
                    let refresh = self.start_refresh();
                    state.in_flight = Some(refresh.clone());
                    refresh
                }
            }
        };
        refresh.await
    }

    /// Forget `rejected` if it is still the cached credential.
    ///
    /// Only the first of several callers holding the same rejected token
    /// clears it; the rest see a different (fresh or in-flight) credential.
    pub fn invalidate(&self, rejected: &Credential) {
        let mut state = self.lock();
        if state.credential.as_ref() == Some(rejected) {
            debug!("Invalidating rejected credential");
            state.credential = None;
        }
    }

    /// Invalidate `rejected` and obtain a new credential.
    pub async fn force_refresh(&self, rejected: &Credential) -> Result<Credential, AuthError> {
        self.invalidate(rejected);
        self.get_token().await
    }

    /// The cached credential, if any, without refreshing.
    pub fn cached(&self) -> Option<Credential> {
        self.lock().credential.clone()
    }

    fn start_refresh(&self) -> RefreshFuture {
        let exchanger = Arc::clone(&self.exchanger);
        let state = Arc::clone(&self.state);
        let safety_factor = self.safety_factor;

        async move {
            info!("Refreshing access token");
            let result = exchanger
                .exchange()
                .await
                .map(|grant| Credential::from_grant(&grant, safety_factor));

            let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
            guard.in_flight = None;
            match &result {
                Ok(credential) => {
                    debug!(ttl = ?credential.time_to_live(), "Stored refreshed access token");
                    guard.credential = Some(credential.clone());
                }
                Err(e) => error!(error = %e, "Access token refresh failed"),
            }
            result
        }
        .boxed()
        .shared()
    }
}

impl fmt::Debug for CredentialCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialCache")
            .field("safety_factor", &self.safety_factor)
            .field("credential", &self.cached())
            .finish()
    }
}
