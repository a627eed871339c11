//! Discovery of this host's externally reachable address, sent to the voice
//! server in `SelectProtocol`.

use anyhow::{Result, anyhow};
use log::{debug, info};
use std::net::IpAddr;
use std::sync::{Arc, OnceLock};
use tokio::sync::OnceCell;
use voicecore::net::{HttpClient, HttpRequest};

pub struct PublicIpResolver {
    http_client: Option<Arc<dyn HttpClient>>,
    url: String,
    cached: OnceCell<IpAddr>,
}

impl std::fmt::Debug for PublicIpResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicIpResolver")
            .field("url", &self.url)
            .field("cached", &self.cached.get())
            .finish()
    }
}

static PROCESS_RESOLVER: OnceLock<Arc<PublicIpResolver>> = OnceLock::new();

impl PublicIpResolver {
    pub fn new(http_client: Arc<dyn HttpClient>, url: impl Into<String>) -> Self {
        Self {
            http_client: Some(http_client),
            url: url.into(),
            cached: OnceCell::new(),
        }
    }

    /// A resolver that never does a lookup.
    pub fn with_fixed(ip: IpAddr) -> Self {
        Self {
            http_client: None,
            url: String::new(),
            cached: OnceCell::new_with(Some(ip)),
        }
    }

    /// The resolver shared by every client in this process. The first caller
    /// decides the HTTP client and lookup URL; later ones get that resolver
    /// whatever they pass.
    pub fn process_default(
        http_client: Arc<dyn HttpClient>,
        url: impl Into<String>,
    ) -> Arc<Self> {
        let url = url.into();
        let mut created = false;
        let resolver = PROCESS_RESOLVER.get_or_init(|| {
            created = true;
            Arc::new(Self::new(http_client, url.clone()))
        });
        if !created && resolver.url != url {
            debug!(
                target: "Voice/PublicIp",
                "Shared resolver already looks up {}, ignoring {url}", resolver.url
            );
        }
        resolver.clone()
    }

    /// Where the address is looked up. Empty for a fixed address.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Looks the address up once, then serves it from cache.
    pub async fn resolve(&self) -> Result<IpAddr> {
        self.cached.get_or_try_init(|| self.fetch()).await.copied()
    }

    async fn fetch(&self) -> Result<IpAddr> {
        let http_client = self
            .http_client
            .as_ref()
            .ok_or_else(|| anyhow!("No HTTP client configured for public IP lookup"))?;

        debug!(target: "Voice/PublicIp", "Looking up public address via {}", self.url);
        let response = http_client
            .execute(HttpRequest::get(&self.url).with_header("accept", "text/plain"))
            .await
            .map_err(|e| anyhow!("HTTP request to {} failed: {}", self.url, e))?;

        if !response.is_success() {
            return Err(anyhow!(
                "Public IP lookup returned status {}",
                response.status_code
            ));
        }

        let body = response
            .body_string()
            .map_err(|e| anyhow!("Failed to decode response body: {}", e))?;
        let ip: IpAddr = body
            .trim()
            .parse()
            .map_err(|e| anyhow!("Public IP lookup returned {:?}: {}", body.trim(), e))?;
        info!(target: "Voice/PublicIp", "Public address is {ip}");
        Ok(ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockHttpClient;

    #[tokio::test]
    async fn test_lookup_is_cached() {
        let http = Arc::new(MockHttpClient::with_body(200, "203.0.113.9\n"));
        let resolver = PublicIpResolver::new(http.clone(), "https://ip.example");

        let first = resolver.resolve().await.unwrap();
        let second = resolver.resolve().await.unwrap();
        assert_eq!(first, "203.0.113.9".parse::<IpAddr>().unwrap());
        assert_eq!(first, second);
        assert_eq!(http.requests(), vec!["https://ip.example".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_lookup_is_retried_later() {
        let http = Arc::new(MockHttpClient::with_body(503, "busy"));
        let resolver = PublicIpResolver::new(http.clone(), "https://ip.example");
        assert!(resolver.resolve().await.is_err());
        assert!(resolver.resolve().await.is_err());
        assert_eq!(http.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_garbage_body_is_error() {
        let http = Arc::new(MockHttpClient::with_body(200, "<html>"));
        let resolver = PublicIpResolver::new(http, "https://ip.example");
        assert!(resolver.resolve().await.is_err());
    }

    #[tokio::test]
    async fn test_process_resolver_keeps_the_first_settings() {
        let first_http = Arc::new(MockHttpClient::with_body(200, "192.0.2.7"));
        let first = PublicIpResolver::process_default(first_http.clone(), "https://first.example");
        let second = PublicIpResolver::process_default(
            Arc::new(MockHttpClient::with_body(200, "192.0.2.8")),
            "https://second.example",
        );

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.url(), "https://first.example");
        assert_eq!(second.resolve().await.unwrap().to_string(), "192.0.2.7");
        assert_eq!(first_http.requests(), vec!["https://first.example".to_string()]);
    }

    #[tokio::test]
    async fn test_fixed_address() {
        let ip: IpAddr = "198.51.100.1".parse().unwrap();
        assert_eq!(PublicIpResolver::with_fixed(ip).resolve().await.unwrap(), ip);
    }
}
