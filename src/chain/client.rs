//! Auction ledger client
//!
//! [`AuctionLedger`] is the narrow surface this crate consumes from the
//! remote contract: position index walks, buy/sell submission, and receipt
//! lookups. [`HttpLedgerClient`] talks to a ledger node's REST gateway and
//! always addresses the provider pool's currently active endpoint, so
//! failover applies to the next request automatically.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::providers::ProviderPool;
use crate::types::{normalize_owner, League, Position, TxKind};

/// Raw position record as the ledger returns it.
///
/// Quantities arrive as decimal strings and timestamps as unix seconds;
/// [`PositionRecord::to_position`] converts to the local shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionRecord {
    pub id: u64,
    pub owner: String,
    pub amount_tokens: String,
    pub buy_price: String,
    pub created_at: i64,
    pub unlock_at: i64,
    pub part_id: u8,
    pub closed: bool,
}

impl PositionRecord {
    /// Convert to the local position shape, deriving league and status.
    ///
    /// Fails on malformed quantities or timestamps; the sync service drops
    /// such records instead of caching them.
    pub fn to_position(&self, now: DateTime<Utc>) -> anyhow::Result<Position> {
        let amount_tokens: u128 = self
            .amount_tokens
            .parse()
            .map_err(|e| anyhow::anyhow!("bad amount_tokens {:?}: {}", self.amount_tokens, e))?;
        let buy_price: u128 = self
            .buy_price
            .parse()
            .map_err(|e| anyhow::anyhow!("bad buy_price {:?}: {}", self.buy_price, e))?;
        let created_at = Utc
            .timestamp_opt(self.created_at, 0)
            .single()
            .ok_or_else(|| anyhow::anyhow!("bad created_at {}", self.created_at))?;
        let unlock_at = Utc
            .timestamp_opt(self.unlock_at, 0)
            .single()
            .ok_or_else(|| anyhow::anyhow!("bad unlock_at {}", self.unlock_at))?;

        Ok(Position {
            id: self.id,
            on_chain_id: Some(self.id),
            owner: normalize_owner(&self.owner),
            amount_tokens,
            buy_price,
            created_at,
            unlock_at,
            part_id: self.part_id,
            league: League::from_buy_price(buy_price),
            closed: self.closed,
            status: Position::derive_status(self.closed, unlock_at, now),
            transaction_hash: None,
        })
    }
}

/// Receipt of a mined transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxReceipt {
    pub hash: String,
    pub success: bool,
    pub block_number: u64,
}

/// Read/write surface of the auction contract.
#[async_trait]
pub trait AuctionLedger: Send + Sync {
    /// Total number of position records in the ledger index.
    async fn position_count(&self) -> anyhow::Result<u64>;

    /// Fetch one record by its index in the ledger walk.
    async fn position_by_index(&self, index: u64) -> anyhow::Result<PositionRecord>;

    /// Fetch one record by its on-chain id.
    async fn position_by_id(&self, id: u64) -> anyhow::Result<PositionRecord>;

    /// Submit a buy for `usd_amount` base units; returns the tx hash.
    async fn submit_buy(&self, owner: &str, usd_amount: u128) -> anyhow::Result<String>;

    /// Submit a sell of the given position; returns the tx hash.
    async fn submit_sell(&self, owner: &str, position_id: u64) -> anyhow::Result<String>;

    /// Receipt for a submitted transaction, if mined.
    async fn transaction_receipt(&self, hash: &str) -> anyhow::Result<Option<TxReceipt>>;

    /// Whether the network still knows the transaction at all.
    async fn transaction_exists(&self, hash: &str) -> anyhow::Result<bool>;
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: u64,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    hash: String,
}

#[derive(Debug, Serialize)]
struct BuyRequest<'a> {
    owner: &'a str,
    amount: String,
    kind: TxKind,
}

#[derive(Debug, Serialize)]
struct SellRequest<'a> {
    owner: &'a str,
    position_id: u64,
    kind: TxKind,
}

/// HTTP client against a ledger node's REST gateway.
pub struct HttpLedgerClient {
    http: reqwest::Client,
    providers: Arc<ProviderPool>,
}

impl HttpLedgerClient {
    pub fn new(providers: Arc<ProviderPool>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self { http, providers })
    }

    fn url(&self, path: &str) -> String {
        let base = self.providers.current_url();
        format!("{}/{}", base.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl AuctionLedger for HttpLedgerClient {
    async fn position_count(&self) -> anyhow::Result<u64> {
        let url = self.url("positions/count");
        let resp: CountResponse = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        debug!("ledger reports {} position records", resp.count);
        Ok(resp.count)
    }

    async fn position_by_index(&self, index: u64) -> anyhow::Result<PositionRecord> {
        let url = self.url(&format!("positions/index/{}", index));
        let record = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(record)
    }

    async fn position_by_id(&self, id: u64) -> anyhow::Result<PositionRecord> {
        let url = self.url(&format!("positions/{}", id));
        let record = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(record)
    }

    async fn submit_buy(&self, owner: &str, usd_amount: u128) -> anyhow::Result<String> {
        let url = self.url("tx/buy");
        let body = BuyRequest {
            owner,
            amount: usd_amount.to_string(),
            kind: TxKind::Buy,
        };
        let resp: SubmitResponse = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        debug!("submitted buy for {}: {}", owner, resp.hash);
        Ok(resp.hash)
    }

    async fn submit_sell(&self, owner: &str, position_id: u64) -> anyhow::Result<String> {
        let url = self.url("tx/sell");
        let body = SellRequest {
            owner,
            position_id,
            kind: TxKind::Sell,
        };
        let resp: SubmitResponse = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        debug!("submitted sell of position {}: {}", position_id, resp.hash);
        Ok(resp.hash)
    }

    async fn transaction_receipt(&self, hash: &str) -> anyhow::Result<Option<TxReceipt>> {
        let url = self.url(&format!("tx/{}/receipt", hash));
        let resp = self.http.get(&url).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let receipt: TxReceipt = resp.error_for_status()?.json().await?;
        Ok(Some(receipt))
    }

    async fn transaction_exists(&self, hash: &str) -> anyhow::Result<bool> {
        let url = self.url(&format!("tx/{}", hash));
        let resp = self.http.get(&url).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        resp.error_for_status()?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderEndpoint;
    use crate::types::PositionStatus;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn pool_for(server: &MockServer) -> Arc<ProviderPool> {
        Arc::new(ProviderPool::new(vec![ProviderEndpoint {
            url: server.uri(),
            name: "mock".to_string(),
            priority: 0,
            is_active: true,
        }]))
    }

    fn record_json(id: u64, owner: &str, closed: bool) -> serde_json::Value {
        json!({
            "id": id,
            "owner": owner,
            "amount_tokens": "1000000000",
            "buy_price": "250000000",
            "created_at": Utc::now().timestamp() - 7200,
            "unlock_at": Utc::now().timestamp() + 7200,
            "part_id": 3,
            "closed": closed,
        })
    }

    #[tokio::test]
    async fn fetches_position_count() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/positions/count"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"count": 12})))
            .mount(&server)
            .await;

        let client = HttpLedgerClient::new(pool_for(&server)).unwrap();
        assert_eq!(client.position_count().await.unwrap(), 12);
    }

    #[tokio::test]
    async fn fetches_and_converts_a_record() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/positions/index/0"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(record_json(5, "0xAAA111bbb222ccc333ddd444eee555fff6667788", false)),
            )
            .mount(&server)
            .await;

        let client = HttpLedgerClient::new(pool_for(&server)).unwrap();
        let record = client.position_by_index(0).await.unwrap();
        let position = record.to_position(Utc::now()).unwrap();
        assert_eq!(position.id, 5);
        assert_eq!(position.amount_tokens, 1_000_000_000);
        assert_eq!(position.status, PositionStatus::Locked);
        assert_eq!(position.owner, "0xaaa111bbb222ccc333ddd444eee555fff6667788");
    }

    #[tokio::test]
    async fn submit_buy_posts_amount_as_string() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tx/buy"))
            .and(body_partial_json(json!({"amount": "50000000"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"hash": "0xdead"})))
            .mount(&server)
            .await;

        let client = HttpLedgerClient::new(pool_for(&server)).unwrap();
        let hash = client.submit_buy("0xaaa", 50_000_000).await.unwrap();
        assert_eq!(hash, "0xdead");
    }

    #[tokio::test]
    async fn missing_receipt_is_none_not_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tx/0xabc/receipt"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = HttpLedgerClient::new(pool_for(&server)).unwrap();
        assert!(client.transaction_receipt("0xabc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_transaction_reports_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tx/0xgone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = HttpLedgerClient::new(pool_for(&server)).unwrap();
        assert!(!client.transaction_exists("0xgone").await.unwrap());
    }

    #[test]
    fn malformed_record_fails_conversion() {
        let record = PositionRecord {
            id: 1,
            owner: "0xaaa".to_string(),
            amount_tokens: "not-a-number".to_string(),
            buy_price: "10".to_string(),
            created_at: 0,
            unlock_at: 100,
            part_id: 1,
            closed: false,
        };
        assert!(record.to_position(Utc::now()).is_err());
    }
}
