//! Public Address Resolution
//!
//! Every rendezvous URL embeds this process's externally visible address, and
//! the dialer compares peer URLs against it. The lookup goes to an
//! address-echo service once; the outcome (address or failure) is cached for
//! the lifetime of the owning service.

use async_trait::async_trait;
use ferry_core::{FerryError, Result};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

/// Source of this process's externally visible address
#[async_trait]
pub trait AddressEcho: Send + Sync {
    /// Return the caller's public address (IP literal or hostname)
    async fn public_address(&self) -> Result<String>;
}

/// Address echo over plain HTTP(S): GET the URL, the body is the address
#[derive(Debug, Clone)]
pub struct HttpAddressEcho {
    url: String,
    client: reqwest::Client,
}

impl HttpAddressEcho {
    /// Create an echo client for `url` (e.g. `https://api.ipify.org`)
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Create an echo client that gives up after `timeout`
    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FerryError::resolution(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl AddressEcho for HttpAddressEcho {
    async fn public_address(&self) -> Result<String> {
        let response = self.client.get(&self.url).send().await.map_err(|e| {
            FerryError::resolution(format!("Failed to query {}: {}", self.url, e))
        })?;

        if !response.status().is_success() {
            return Err(FerryError::resolution(format!(
                "{} answered {}",
                self.url,
                response.status()
            )));
        }

        let body = response.text().await.map_err(|e| {
            FerryError::resolution(format!("Failed to read response from {}: {}", self.url, e))
        })?;

        let address = body.trim();
        if address.is_empty() {
            return Err(FerryError::resolution(format!(
                "{} returned an empty address",
                self.url
            )));
        }
        Ok(address.to_string())
    }
}

/// Fixed address, for hosts with a known public name and for tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticAddressEcho(pub String);

#[async_trait]
impl AddressEcho for StaticAddressEcho {
    async fn public_address(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Cached, shared public address
///
/// Concurrent callers of [`PublicAddress::resolve`] all wait on the same
/// lookup; the echo service is queried at most once.
#[derive(Clone)]
pub struct PublicAddress {
    echo: Arc<dyn AddressEcho>,
    cached: Arc<OnceCell<Result<String>>>,
}

impl fmt::Debug for PublicAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicAddress")
            .field("cached", &self.cached.get())
            .finish()
    }
}

impl PublicAddress {
    /// Wrap an echo source; nothing is queried until the first `resolve`
    pub fn new(echo: Arc<dyn AddressEcho>) -> Self {
        Self {
            echo,
            cached: Arc::new(OnceCell::new()),
        }
    }

    /// Resolve (once) and return the public address
    pub async fn resolve(&self) -> Result<String> {
        self.cached
            .get_or_init(|| async {
                let result = self.echo.public_address().await;
                match &result {
                    Ok(address) => tracing::info!(address = %address, "Resolved public address"),
                    Err(e) => tracing::warn!(error = %e, "Public address resolution failed"),
                }
                result
            })
            .await
            .clone()
    }

    /// Cached result, if the lookup has finished
    pub fn cached(&self) -> Option<Result<String>> {
        self.cached.get().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEcho {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl AddressEcho for CountingEcho {
        async fn public_address(&self) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            if self.fail {
                Err(FerryError::resolution("echo offline"))
            } else {
                Ok("203.0.113.9".to_string())
            }
        }
    }

    #[tokio::test]
    async fn test_resolves_once() {
        let echo = Arc::new(CountingEcho {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let address = PublicAddress::new(echo.clone());
        assert!(address.cached().is_none());

        let shared = address.clone();
        let (a, b) = tokio::join!(address.resolve(), shared.resolve());
        assert_eq!(a.unwrap(), "203.0.113.9");
        assert_eq!(b.unwrap(), "203.0.113.9");
        assert_eq!(address.resolve().await.unwrap(), "203.0.113.9");
        assert_eq!(echo.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_is_cached() {
        let echo = Arc::new(CountingEcho {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let address = PublicAddress::new(echo.clone());

        assert!(matches!(
            address.resolve().await,
            Err(FerryError::Resolution { .. })
        ));
        assert!(address.resolve().await.is_err());
        assert_eq!(echo.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_static_echo() {
        let address = PublicAddress::new(Arc::new(StaticAddressEcho("example.net".into())));
        assert_eq!(address.resolve().await.unwrap(), "example.net");
        assert_eq!(address.cached(), Some(Ok("example.net".to_string())));
    }

    #[tokio::test]
    #[ignore = "queries the public address-echo service"]
    async fn test_http_echo_live() {
        let echo = HttpAddressEcho::with_timeout("https://api.ipify.org", Duration::from_secs(5))
            .unwrap();
        let address = echo.public_address().await.unwrap();
        assert_eq!(address.split('.').count(), 4);
    }
}
