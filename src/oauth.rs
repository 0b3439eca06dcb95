//! OAuth 1.0a token acquisition against the Evernote authorization service.
//!
//! Request token → browser grant page → one-shot local callback listener →
//! access token exchange. Signatures use PLAINTEXT over TLS.

use axum::extract::State;
use axum::http::{header, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use url::{form_urlencoded, Url};

use crate::error::{Error, Result};
use crate::store::edam;

const DEFAULT_CALLBACK_PORT: u16 = 80;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestToken {
    pub token: String,
    pub secret: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub note_store_url: Option<String>,
    pub user_id: Option<i32>,
    /// Expiry in epoch milliseconds
    pub expires: Option<i64>,
}

pub struct OAuthClient {
    http: reqwest::Client,
    host: String,
    consumer_key: String,
    consumer_secret: String,
}

impl OAuthClient {
    pub fn new(host: &str, consumer_key: &str, consumer_secret: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Handshake(e.to_string()))?;
        Ok(Self {
            http,
            host: host.trim_end_matches('/').to_string(),
            consumer_key: consumer_key.to_string(),
            consumer_secret: consumer_secret.to_string(),
        })
    }

    fn oauth_params(&self, token_secret: &str) -> Vec<(&'static str, String)> {
        vec![
            ("oauth_consumer_key", self.consumer_key.clone()),
            ("oauth_nonce", uuid::Uuid::new_v4().simple().to_string()),
            // PLAINTEXT: consumer secret and token secret, each percent-encoded
            (
                "oauth_signature",
                format!("{}&{}", percent_encode(&self.consumer_secret), percent_encode(token_secret)),
            ),
            ("oauth_signature_method", "PLAINTEXT".to_string()),
            ("oauth_timestamp", chrono::Utc::now().timestamp().to_string()),
            ("oauth_version", "1.0".to_string()),
        ]
    }

    async fn token_call(&self, params: Vec<(&'static str, String)>) -> Result<HashMap<String, String>> {
        let url = format!("{}/oauth", self.host);
        let response = self
            .http
            .get(&url)
            .query(&params)
            .send()
            .await
            .map_err(|e| Error::Handshake(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Handshake(e.to_string()))?;
        if !status.is_success() {
            return Err(Error::Handshake(format!("{}: {}", status, body.trim())));
        }
        Ok(parse_form(&body))
    }

    pub async fn get_request_token(&self, callback_url: &str) -> Result<RequestToken> {
        let mut params = self.oauth_params("");
        params.push(("oauth_callback", callback_url.to_string()));

        let mut values = self.token_call(params).await?;
        let token = values
            .remove("oauth_token")
            .ok_or_else(|| Error::Handshake("no oauth_token in response".to_string()))?;
        let secret = values.remove("oauth_token_secret").unwrap_or_default();
        debug!(token = %token, "request token obtained");
        Ok(RequestToken { token, secret })
    }

    pub fn get_auth_url(&self, request_token: &RequestToken) -> String {
        format!(
            "{}/OAuth.action?oauth_token={}",
            self.host,
            percent_encode(&request_token.token)
        )
    }

    pub async fn get_access_token(&self, request_token: &RequestToken, verifier: &str) -> Result<AccessToken> {
        let mut params = self.oauth_params(&request_token.secret);
        params.push(("oauth_token", request_token.token.clone()));
        params.push(("oauth_verifier", verifier.to_string()));

        let mut values = self.token_call(params).await?;
        let token = values
            .remove("oauth_token")
            .ok_or_else(|| Error::Handshake("no access token in response".to_string()))?;
        Ok(AccessToken {
            token,
            note_store_url: values.remove("edam_noteStoreUrl"),
            user_id: values.get("edam_userId").and_then(|v| v.parse().ok()),
            expires: values.get("edam_expires").and_then(|v| v.parse().ok()),
        })
    }

    /// One authenticated read. Any failure counts as `false`.
    pub async fn test_access_token(&self, token: &str) -> bool {
        match edam::fetch_user(&self.host, token).await {
            Ok(user) => {
                debug!(user_id = user.id, "token accepted");
                true
            }
            Err(e) => {
                warn!(error = %e, "token test failed");
                false
            }
        }
    }

    /// The whole flow, from request token to access token.
    pub async fn process_token_request(&self, callback_url: &str, timeout: Duration) -> Result<AccessToken> {
        let request_token = self.get_request_token(callback_url).await?;

        // Bind before the browser can redirect back
        let listener = CallbackListener::bind(callback_url).await?;

        let auth_url = self.get_auth_url(&request_token);
        open_access_grant_page(&auth_url);

        let verifier = listener.wait_for_verifier(timeout).await?;
        self.get_access_token(&request_token, &verifier).await
    }
}

/// Launch the default browser. There is no confirmation.
pub fn open_access_grant_page(auth_url: &str) {
    info!(url = %auth_url, "open access grant page");
    if let Err(e) = open::that(auth_url) {
        warn!(error = %e, "cannot open browser, visit the URL manually");
    }
}

/// Wait for the browser to come back to `callback_url` and return the verifier.
pub async fn handle_access_grant_return(callback_url: &str, timeout: Duration) -> Result<String> {
    CallbackListener::bind(callback_url)
        .await?
        .wait_for_verifier(timeout)
        .await
}

type QuerySlot = Arc<Mutex<Option<oneshot::Sender<String>>>>;

/// One-shot HTTP listener for the authorization redirect.
pub struct CallbackListener {
    listener: TcpListener,
}

impl CallbackListener {
    pub async fn bind(callback_url: &str) -> Result<Self> {
        let (host, port) = callback_host_port(callback_url)?;
        debug!(host = %host, port, "bind callback listener");
        let listener = TcpListener::bind((host.as_str(), port)).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until the first request arrives, then stop.
    pub async fn wait_for_verifier(self, timeout: Duration) -> Result<String> {
        let (query_tx, query_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let slot: QuerySlot = Arc::new(Mutex::new(Some(query_tx)));

        // Only the browser's GET redirect fills the slot; other methods get 405
        let app = Router::new()
            .fallback(get(handle_callback))
            .with_state(slot);
        let server = tokio::spawn(async move {
            axum::serve(self.listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        let received = tokio::time::timeout(timeout, query_rx).await;

        let _ = shutdown_tx.send(());
        if tokio::time::timeout(SHUTDOWN_GRACE, server).await.is_err() {
            debug!("callback listener did not stop in time");
        }

        let query = match received {
            Ok(Ok(query)) => query,
            Ok(Err(_)) => return Err(Error::Handshake("callback listener stopped".to_string())),
            Err(_) => return Err(Error::TimedOut(timeout)),
        };
        parse_verifier(&query)
    }
}

async fn handle_callback(State(slot): State<QuerySlot>, uri: Uri) -> impl IntoResponse {
    let query = uri.query().unwrap_or_default().to_string();
    let sender = slot.lock().ok().and_then(|mut s| s.take());
    match sender {
        Some(sender) => {
            debug!(path = %uri.path(), "authorization callback received");
            let _ = sender.send(query);
        }
        None => debug!(path = %uri.path(), "extra callback request ignored"),
    }
    (StatusCode::OK, [(header::CONNECTION, "close")])
}

/// Host and port of the callback URL; port 80 when none is given.
pub fn callback_host_port(callback_url: &str) -> Result<(String, u16)> {
    let url = Url::parse(callback_url)
        .map_err(|e| Error::Config(format!("invalid callback URL {}: {}", callback_url, e)))?;
    let host = url
        .host_str()
        .ok_or_else(|| Error::Config(format!("callback URL {} has no host", callback_url)))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    Ok((host, url.port().unwrap_or(DEFAULT_CALLBACK_PORT)))
}

/// `oauth_verifier` from a callback query string.
pub fn parse_verifier(query: &str) -> Result<String> {
    let mut values = parse_form(query);
    if !values.contains_key("oauth_token") {
        return Err(Error::Rejected("callback carried no oauth_token".to_string()));
    }
    values
        .remove("oauth_verifier")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::Rejected("access was not granted".to_string()))
}

fn parse_form(body: &str) -> HashMap<String, String> {
    form_urlencoded::parse(body.trim().as_bytes())
        .into_owned()
        .collect()
}

fn percent_encode(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes()).collect()
}
