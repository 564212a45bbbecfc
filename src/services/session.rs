//! Kameo session authentication.
//!
//! Kameo has no API-key auth: the bot logs in the way a browser does and
//! the session lives in the shared cookie jar.
//!
//! Login flow:
//! 1. GET  /user/login  primes the session cookie
//! 2. POST /user/login  with form fields `Login`, `Password`, `LoginButton`, `RedirectURI`
//! 3. GET  /auth/2fa    to extract the `ezxform_token` form field
//! 4. POST /auth/2fa    with form fields `ezxform_token`, `code`, `submit_code`
//!
//! Outcomes are carried by the redirect target, not the status code: a
//! rejected password lands back on /user/login and an accepted one on
//! /auth/2fa (or the dashboard for accounts without a second factor).
//!
//! `ensure_authenticated` is safe to call from concurrent tasks. Exactly
//! one login runs at a time; every caller that observes it in flight
//! receives the same outcome, including failures.

use super::platform_errors::PlatformError;
use super::totp::TotpGenerator;
use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

const LOGIN_PATH: &str = "/user/login";
const SECOND_FACTOR_PATH: &str = "/auth/2fa";
const TRANSFER_INIT_PATH: &str = "/ezjscore/call/kameo_transfer::init";

/// Credentials the authenticator logs in with
#[derive(Debug, Clone)]
pub struct Credential {
    pub username: String,
    pub password: String,
    /// Base32 TOTP seed for the second factor
    pub totp_seed: String,
}

/// What the platform answered to a username/password submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialOutcome {
    /// Session is fully authenticated, no second factor configured
    Authenticated,
    /// Password accepted, authenticator code requested
    SecondFactorRequired,
    /// Username or password not accepted
    Rejected,
}

/// Transport for the login conversation. Implemented over HTTP in
/// production and hand-rolled in tests.
#[async_trait]
pub trait AuthTransport: Send + Sync {
    /// Load the login page so the server issues a session cookie
    async fn fetch_login_form(&self) -> Result<(), PlatformError>;

    /// Submit username and password
    async fn submit_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<CredentialOutcome, PlatformError>;

    /// Load the second-factor page and extract its form token
    async fn fetch_second_factor_token(&self) -> Result<String, PlatformError>;

    /// Submit the authenticator code. Returns true when accepted.
    async fn submit_second_factor(&self, form_token: &str, code: &str)
        -> Result<bool, PlatformError>;

    /// Cheap check whether the current cookie is still accepted
    async fn probe_session(&self) -> Result<bool, PlatformError>;
}

// ---------------------------------------------------------------------------
// Authenticator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum SessionState {
    Unauthenticated,
    Authenticated { since: Instant, last_verified: Instant },
}

/// How a refresh was satisfied
enum Established {
    /// Existing cookie confirmed by a probe
    Verified,
    /// Fresh full login
    LoggedIn,
}

struct AuthState {
    session: SessionState,
    /// Present while a login/probe is running; carries its outcome to
    /// every waiting caller
    login_in_flight: Option<broadcast::Sender<Result<(), PlatformError>>>,
}

/// Session status snapshot for status displays
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub authenticated: bool,
    pub age_secs: Option<u64>,
    pub verified_secs_ago: Option<u64>,
}

/// Owns the login lifecycle: performs the form login with TOTP second
/// factor, tracks session freshness, and re-authenticates on expiry.
pub struct SessionAuthenticator {
    transport: Arc<dyn AuthTransport>,
    username: String,
    password: String,
    totp: TotpGenerator,
    /// How long a verification result is trusted before re-probing
    probe_ttl: Duration,
    state: Mutex<AuthState>,
}

impl SessionAuthenticator {
    pub fn new(
        transport: Arc<dyn AuthTransport>,
        credential: Credential,
        probe_ttl: Duration,
    ) -> Result<Self, PlatformError> {
        let totp = TotpGenerator::new(&credential.totp_seed)?;
        Ok(Self {
            transport,
            username: credential.username,
            password: credential.password,
            totp,
            probe_ttl,
            state: Mutex::new(AuthState {
                session: SessionState::Unauthenticated,
                login_in_flight: None,
            }),
        })
    }

    /// Make sure the session is usable before an API call.
    ///
    /// Fast path: a session verified within the probe TTL passes without
    /// any network traffic. Otherwise one caller becomes the leader and
    /// probes or re-logs-in while everyone else waits for its result.
    pub async fn ensure_authenticated(&self) -> Result<(), PlatformError> {
        let (tx, needs_probe) = {
            let mut st = self.state.lock().await;

            if let SessionState::Authenticated { last_verified, .. } = st.session {
                if last_verified.elapsed() < self.probe_ttl {
                    return Ok(());
                }
            }

            if let Some(tx) = &st.login_in_flight {
                let mut rx = tx.subscribe();
                drop(st);
                return match rx.recv().await {
                    Ok(result) => result,
                    Err(_) => Err(PlatformError::Authentication(
                        "authentication attempt was interrupted".to_string(),
                    )),
                };
            }

            let (tx, _) = broadcast::channel(1);
            st.login_in_flight = Some(tx.clone());
            let needs_probe = matches!(st.session, SessionState::Authenticated { .. });
            (tx, needs_probe)
        };

        let outcome = self.establish(needs_probe).await;
        let result = outcome.as_ref().map(|_| ()).map_err(|e| e.clone());

        let mut st = self.state.lock().await;
        st.login_in_flight = None;
        let now = Instant::now();
        match outcome {
            Ok(Established::Verified) => {
                if let SessionState::Authenticated { last_verified, .. } = &mut st.session {
                    *last_verified = now;
                }
            }
            Ok(Established::LoggedIn) => {
                st.session = SessionState::Authenticated {
                    since: now,
                    last_verified: now,
                };
            }
            Err(_) => {
                st.session = SessionState::Unauthenticated;
            }
        }
        drop(st);

        let _ = tx.send(result.clone());
        result
    }

    /// Forget the current session. The next call re-authenticates.
    /// Called when the platform rejects a request with 401.
    pub async fn mark_expired(&self) {
        let mut st = self.state.lock().await;
        if matches!(st.session, SessionState::Authenticated { .. }) {
            debug!("Session marked expired, next call will re-authenticate");
        }
        st.session = SessionState::Unauthenticated;
    }

    pub async fn is_authenticated(&self) -> bool {
        matches!(
            self.state.lock().await.session,
            SessionState::Authenticated { .. }
        )
    }

    pub async fn status(&self) -> SessionStatus {
        let st = self.state.lock().await;
        match st.session {
            SessionState::Authenticated {
                since,
                last_verified,
            } => SessionStatus {
                authenticated: true,
                age_secs: Some(since.elapsed().as_secs()),
                verified_secs_ago: Some(last_verified.elapsed().as_secs()),
            },
            SessionState::Unauthenticated => SessionStatus {
                authenticated: false,
                age_secs: None,
                verified_secs_ago: None,
            },
        }
    }

    /// Probe a stale session first; fall back to a full login
    async fn establish(&self, try_probe: bool) -> Result<Established, PlatformError> {
        if try_probe {
            match self.transport.probe_session().await {
                Ok(true) => {
                    debug!("Session probe confirmed the cookie is still accepted");
                    return Ok(Established::Verified);
                }
                Ok(false) => debug!("Session probe rejected, performing a full login"),
                Err(e) => warn!("Session probe failed ({}), performing a full login", e),
            }
        }
        self.login().await?;
        Ok(Established::LoggedIn)
    }

    async fn login(&self) -> Result<(), PlatformError> {
        info!("Logging in to Kameo as {}", self.username);

        self.transport.fetch_login_form().await?;

        match self
            .transport
            .submit_credentials(&self.username, &self.password)
            .await?
        {
            CredentialOutcome::Authenticated => {}
            CredentialOutcome::Rejected => {
                return Err(PlatformError::Authentication(
                    "username or password rejected".to_string(),
                ));
            }
            CredentialOutcome::SecondFactorRequired => {
                debug!("Second factor requested");
                let form_token = self.transport.fetch_second_factor_token().await?;
                let code = self.totp.current_code()?;
                if !self
                    .transport
                    .submit_second_factor(&form_token, &code)
                    .await?
                {
                    return Err(PlatformError::Authentication(
                        "second factor code rejected".to_string(),
                    ));
                }
            }
        }

        info!("Kameo login successful");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// HTTP transport
// ---------------------------------------------------------------------------

/// Production transport over the shared cookie-carrying HTTP client
pub struct HttpAuthTransport {
    http: Client,
    base_url: String,
}

impl HttpAuthTransport {
    pub fn new(http: Client, base_url: String) -> Self {
        Self { http, base_url }
    }

    fn login_url(&self) -> String {
        format!("{}{}", self.base_url, LOGIN_PATH)
    }

    fn second_factor_url(&self) -> String {
        format!("{}{}", self.base_url, SECOND_FACTOR_PATH)
    }

    fn probe_url(&self) -> String {
        format!("{}{}", self.base_url, TRANSFER_INIT_PATH)
    }
}

/// Pull the hidden `ezxform_token` field out of the second-factor page
fn extract_form_token(html: &str) -> Option<String> {
    let re = Regex::new(r#"name="ezxform_token"[^>]*value="([^"]*)""#).ok()?;
    re.captures(html).map(|c| c[1].to_string())
}

#[async_trait]
impl AuthTransport for HttpAuthTransport {
    async fn fetch_login_form(&self) -> Result<(), PlatformError> {
        let resp = self
            .http
            .get(self.login_url())
            .send()
            .await
            .map_err(|e| PlatformError::from_network_error(&e))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(PlatformError::from_response(status, &body));
        }
        Ok(())
    }

    async fn submit_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<CredentialOutcome, PlatformError> {
        let resp = self
            .http
            .post(self.login_url())
            .form(&[
                ("Login", username),
                ("Password", password),
                ("LoginButton", ""),
                ("RedirectURI", ""),
            ])
            .send()
            .await
            .map_err(|e| PlatformError::from_network_error(&e))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(PlatformError::from_response(status, &body));
        }

        // The post-redirect URL tells us where the flow landed
        let path = resp.url().path().to_string();
        if path.contains(SECOND_FACTOR_PATH) {
            Ok(CredentialOutcome::SecondFactorRequired)
        } else if path.contains(LOGIN_PATH) {
            Ok(CredentialOutcome::Rejected)
        } else {
            Ok(CredentialOutcome::Authenticated)
        }
    }

    async fn fetch_second_factor_token(&self) -> Result<String, PlatformError> {
        let resp = self
            .http
            .get(self.second_factor_url())
            .send()
            .await
            .map_err(|e| PlatformError::from_network_error(&e))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(PlatformError::from_response(status, &body));
        }

        let html = resp
            .text()
            .await
            .map_err(|e| PlatformError::from_network_error(&e))?;

        extract_form_token(&html).ok_or_else(|| {
            PlatformError::Authentication("second factor form token not found".to_string())
        })
    }

    async fn submit_second_factor(
        &self,
        form_token: &str,
        code: &str,
    ) -> Result<bool, PlatformError> {
        let resp = self
            .http
            .post(self.second_factor_url())
            .form(&[
                ("ezxform_token", form_token),
                ("code", code),
                ("submit_code", ""),
            ])
            .send()
            .await
            .map_err(|e| PlatformError::from_network_error(&e))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(PlatformError::from_response(status, &body));
        }

        // Acceptance moves the session off the 2fa page
        Ok(!resp.url().path().contains(SECOND_FACTOR_PATH))
    }

    async fn probe_session(&self) -> Result<bool, PlatformError> {
        let resp = self
            .http
            .get(self.probe_url())
            .send()
            .await
            .map_err(|e| PlatformError::from_network_error(&e))?;

        // An expired cookie bounces the probe to the login page
        Ok(resp.status().is_success() && !resp.url().path().contains(LOGIN_PATH))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
