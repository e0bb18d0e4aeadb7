//! Upstream DEX price API client (§6.1). Client wire-format specifics beyond
//! the rate contract are out of scope (§1 Non-goals); this implements just
//! enough of the pairs-by-token endpoint to hand `DexPair`s to the collector,
//! following the teacher's `DomeRestClient` shape (`reqwest::Client` with a
//! pooled, keep-alive builder and a single base URL).

use crate::collector::{DexPair, DexPriceClient, FetchOutcome};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

const DEFAULT_BASE_URL: &str = "https://api.dexscreener.com/latest/dex";

pub struct HttpDexPriceClient {
    client: Client,
    base_url: String,
}

impl HttpDexPriceClient {
    pub fn new(http_timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(http_timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .build()?;
        Ok(Self { client, base_url: DEFAULT_BASE_URL.to_string() })
    }
}

#[derive(Debug, Deserialize)]
struct PairsResponse {
    #[serde(default)]
    pairs: Option<Vec<RawPair>>,
}

#[derive(Debug, Deserialize)]
struct RawPair {
    #[serde(rename = "chainId")]
    chain_id: String,
    #[serde(rename = "baseToken")]
    base_token: TokenRef,
    #[serde(rename = "quoteToken")]
    quote_token: TokenRef,
    #[serde(rename = "priceNative", deserialize_with = "str_or_f64")]
    price_native: f64,
    #[serde(rename = "priceUsd", deserialize_with = "str_or_f64")]
    price_usd: f64,
    liquidity: Option<Liquidity>,
    volume: Option<Volume>,
    #[serde(rename = "priceChange")]
    price_change: Option<PriceChange>,
    #[serde(rename = "marketCap")]
    market_cap: Option<f64>,
    fdv: Option<f64>,
    #[serde(rename = "dexId")]
    dex_id: String,
    #[serde(rename = "pairAddress")]
    pair_address: String,
}

#[derive(Debug, Deserialize)]
struct TokenRef {
    address: String,
    symbol: String,
}

#[derive(Debug, Deserialize, Default)]
struct Liquidity {
    #[serde(default)]
    usd: f64,
}

#[derive(Debug, Deserialize, Default)]
struct Volume {
    #[serde(default, rename = "h24")]
    h24: f64,
    #[serde(default, rename = "h6")]
    h6: f64,
    #[serde(default, rename = "h1")]
    h1: f64,
    #[serde(default, rename = "m5")]
    m5: f64,
}

#[derive(Debug, Deserialize, Default)]
struct PriceChange {
    #[serde(default, rename = "h24")]
    h24: f64,
}

fn str_or_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StrOrF64 {
        Str(String),
        Num(f64),
    }
    match StrOrF64::deserialize(deserializer)? {
        StrOrF64::Str(s) => s.parse().map_err(serde::de::Error::custom),
        StrOrF64::Num(n) => Ok(n),
    }
}

#[async_trait]
impl DexPriceClient for HttpDexPriceClient {
    async fn fetch(&self, token_contract: &str, chain: &str) -> FetchOutcome {
        let url = format!("{}/tokens/{}", self.base_url, token_contract);
        let response = match self.client.get(&url).send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => return FetchOutcome::Transient,
            Err(e) => {
                warn!(error = %e, token_contract, "dex price fetch failed");
                return FetchOutcome::Transient;
            }
        };

        if response.status().as_u16() == 429 {
            return FetchOutcome::RateLimited;
        }
        if response.status().is_server_error() {
            return FetchOutcome::Transient;
        }
        if !response.status().is_success() {
            return FetchOutcome::Malformed;
        }

        let parsed: PairsResponse = match response.json().await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, token_contract, "dex price response did not parse");
                return FetchOutcome::Malformed;
            }
        };

        let Some(raw_pairs) = parsed.pairs else { return FetchOutcome::Malformed };
        if raw_pairs.is_empty() {
            return FetchOutcome::Malformed;
        }

        let pairs = raw_pairs
            .into_iter()
            .filter(|p| p.chain_id.eq_ignore_ascii_case(chain) && p.base_token.address.eq_ignore_ascii_case(token_contract))
            .map(|p| DexPair {
                chain_id: p.chain_id,
                base_token_address: p.base_token.address,
                quote_token_address: p.quote_token.address,
                quote_token_symbol: p.quote_token.symbol,
                price_native: p.price_native,
                price_usd: p.price_usd,
                liquidity_usd: p.liquidity.unwrap_or_default().usd,
                volume_h24: p.volume.as_ref().map(|v| v.h24).unwrap_or_default(),
                volume_h6: p.volume.as_ref().map(|v| v.h6).unwrap_or_default(),
                volume_h1: p.volume.as_ref().map(|v| v.h1).unwrap_or_default(),
                volume_m5: p.volume.as_ref().map(|v| v.m5).unwrap_or_default(),
                price_change_h24: p.price_change.unwrap_or_default().h24,
                market_cap: p.market_cap.unwrap_or_default(),
                fdv: p.fdv.unwrap_or_default(),
                dex_id: p.dex_id,
                pair_address: p.pair_address,
            })
            .collect::<Vec<_>>();

        if pairs.is_empty() {
            FetchOutcome::Malformed
        } else {
            FetchOutcome::Pairs(pairs)
        }
    }
}
