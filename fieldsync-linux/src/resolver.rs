//! Rendezvous: derive the session namespace from our public address.

use fieldsync_core::Namespace;
use serde::Deserialize;

use crate::config::Config;

#[derive(Debug, Deserialize)]
struct LookupResponse {
    ip: String,
}

/// Resolve the namespace for this session. Never fails: any lookup error
/// falls back to the shared public room. One attempt, no retry.
pub async fn resolve(config: &Config) -> Namespace {
    if let Some(room) = &config.room {
        tracing::info!(room, "using configured room");
        return Namespace::from_address(room);
    }
    match lookup_address(&config.lookup_url).await {
        Ok(ip) => {
            tracing::info!(%ip, "public address resolved");
            Namespace::from_address(&ip)
        }
        Err(e) => {
            tracing::warn!(error = %e, url = %config.lookup_url, "address lookup failed, using public room");
            Namespace::fallback()
        }
    }
}

async fn lookup_address(url: &str) -> Result<String, LookupError> {
    let resp = reqwest::get(url).await?.error_for_status()?;
    let body: LookupResponse = resp.json().await?;
    let ip = body.ip.trim();
    if ip.is_empty() {
        return Err(LookupError::EmptyAddress);
    }
    Ok(ip.to_string())
}

#[derive(Debug, thiserror::Error)]
enum LookupError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("empty address in response")]
    EmptyAddress,
}
