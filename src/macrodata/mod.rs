//! Macro indicator snapshots (VIX, VHSI, CIVIX, DXY, Fear & Greed).
//!
//! Providers never fail: any fetch or decode problem is logged and the
//! affected fields fall back to neutral defaults, so a feed outage can
//! degrade regime quality but never stop a reconciliation tick.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

use crate::config::MacroFeedConfig;

/// One point-in-time reading of every supported indicator.
#[derive(Debug, Clone, PartialEq)]
pub struct MacroSnapshot {
    pub vix: Decimal,
    pub vhsi: Decimal,
    pub civix: Decimal,
    pub dxy: Decimal,
    pub fear_greed: Decimal,
}

impl Default for MacroSnapshot {
    /// Neutral readings used when a feed is unavailable.
    fn default() -> Self {
        Self {
            vix: Decimal::new(18, 0),
            vhsi: Decimal::new(22, 0),
            civix: Decimal::new(18, 0),
            dxy: Decimal::new(100, 0),
            fear_greed: Decimal::new(50, 0),
        }
    }
}

impl MacroSnapshot {
    /// Look up an indicator by its config name.
    pub fn indicator(&self, name: &str) -> Option<Decimal> {
        match name {
            "vix" => Some(self.vix),
            "vhsi" => Some(self.vhsi),
            "civix" => Some(self.civix),
            "dxy" => Some(self.dxy),
            "fear_greed" => Some(self.fear_greed),
            _ => None,
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MacroDataProvider: Send + Sync {
    /// Fetch the latest indicator readings. Infallible by contract:
    /// implementations substitute defaults rather than returning errors.
    async fn snapshot(&self) -> MacroSnapshot;
}

/// Wire format of the snapshot endpoint. Fields the feed omits are filled
/// from [`MacroSnapshot::default`].
#[derive(Debug, Deserialize)]
struct RawSnapshot {
    vix: Option<Decimal>,
    vhsi: Option<Decimal>,
    civix: Option<Decimal>,
    dxy: Option<Decimal>,
    fear_greed: Option<Decimal>,
}

/// HTTP-backed provider hitting `GET {base_url}/macro/snapshot`.
pub struct HttpMacroProvider {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMacroProvider {
    pub fn new(config: &MacroFeedConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn fetch(&self) -> anyhow::Result<RawSnapshot> {
        let url = format!("{}/macro/snapshot", self.base_url);
        let resp = self.client.get(&url).send().await?.error_for_status()?;
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl MacroDataProvider for HttpMacroProvider {
    async fn snapshot(&self) -> MacroSnapshot {
        let defaults = MacroSnapshot::default();
        match self.fetch().await {
            Ok(raw) => MacroSnapshot {
                vix: raw.vix.unwrap_or(defaults.vix),
                vhsi: raw.vhsi.unwrap_or(defaults.vhsi),
                civix: raw.civix.unwrap_or(defaults.civix),
                dxy: raw.dxy.unwrap_or(defaults.dxy),
                fear_greed: raw.fear_greed.unwrap_or(defaults.fear_greed),
            },
            Err(e) => {
                warn!("macro feed unavailable, using neutral defaults: {e:#}");
                defaults
            }
        }
    }
}

/// Fixed-value provider for offline runs and tests.
pub struct StaticMacroProvider {
    snapshot: MacroSnapshot,
}

impl StaticMacroProvider {
    pub fn new(snapshot: MacroSnapshot) -> Self {
        Self { snapshot }
    }
}

impl Default for StaticMacroProvider {
    fn default() -> Self {
        Self::new(MacroSnapshot::default())
    }
}

#[async_trait]
impl MacroDataProvider for StaticMacroProvider {
    async fn snapshot(&self) -> MacroSnapshot {
        self.snapshot.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn feed_config(base_url: String) -> MacroFeedConfig {
        MacroFeedConfig {
            base_url,
            timeout_secs: 2,
        }
    }

    #[tokio::test]
    async fn test_http_provider_parses_partial_payload() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/macro/snapshot"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "vix": "32.5",
                "fear_greed": "12"
            })))
            .mount(&server)
            .await;

        let provider = HttpMacroProvider::new(&feed_config(server.uri())).unwrap();
        let snapshot = provider.snapshot().await;

        assert_eq!(snapshot.vix, dec!(32.5));
        assert_eq!(snapshot.fear_greed, dec!(12));
        // Omitted fields fall back to neutral defaults
        assert_eq!(snapshot.vhsi, dec!(22));
        assert_eq!(snapshot.dxy, dec!(100));
    }

    #[tokio::test]
    async fn test_http_provider_defaults_on_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/macro/snapshot"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let provider = HttpMacroProvider::new(&feed_config(server.uri())).unwrap();
        assert_eq!(provider.snapshot().await, MacroSnapshot::default());
    }

    #[test]
    fn test_indicator_lookup() {
        let snapshot = MacroSnapshot::default();
        assert_eq!(snapshot.indicator("vix"), Some(dec!(18)));
        assert_eq!(snapshot.indicator("unknown"), None);
    }
}
