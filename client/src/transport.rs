//! Synch transport.
//!
//! A synch is a single round-trip: the aggregate [`SynchRequest`] of every
//! table goes out, a map of per-table responses comes back. Retrying and
//! timeouts are handled by the coordinator; a transport performs exactly one
//! attempt per call.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use stash_engine::{TableSynchRequest, TableSynchResponse};
use tracing::debug;

use crate::config::DatabaseConfig;
use crate::error::TransportError;

/// Aggregate synch request for a whole database.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynchRequest {
    /// Time of the last successful synch
    pub last_synched: Option<DateTime<Utc>>,
    /// Per-table requests, keyed by table name
    #[serde(flatten)]
    pub tables: BTreeMap<String, TableSynchRequest>,
}

impl SynchRequest {
    /// Whether any table carries a local change.
    pub fn has_changes(&self) -> bool {
        self.tables.values().any(TableSynchRequest::has_changes)
    }
}

/// Aggregate synch response, keyed by table name.
pub type SynchResponse = BTreeMap<String, TableSynchResponse>;

/// A way of delivering synch requests to a server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform one synch round-trip.
    async fn send(&self, request: &SynchRequest) -> Result<SynchResponse, TransportError>;
}

/// Transport posting JSON over HTTP.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn from_config(config: &DatabaseConfig) -> Result<Self, TransportError> {
        Self::new(config.synch_url.clone(), config.timeout())
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &SynchRequest) -> Result<SynchResponse, TransportError> {
        debug!(url = %self.url, tables = request.tables.len(), "posting synch request");
        let response = self.client.post(&self.url).json(request).send().await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(TransportError::Status(status.as_u16()));
        }

        Ok(response.json::<SynchResponse>().await?)
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_decode() {
            TransportError::Decode(err.to_string())
        } else {
            TransportError::Network(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stash_engine::Key;

    #[test]
    fn request_carries_last_synched_next_to_tables() {
        let mut request = SynchRequest::default();
        request.tables.insert(
            "cowboys".to_string(),
            TableSynchRequest {
                identities: vec![Key::Int(1)],
                versions: vec![json!(3)],
                ..Default::default()
            },
        );

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["lastSynched"], json!(null));
        assert_eq!(value["cowboys"]["identities"], json!([1]));
        assert_eq!(value["cowboys"]["versions"], json!([3]));
        assert!(!request.has_changes());

        let parsed: SynchRequest = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn response_is_keyed_by_table() {
        let response: SynchResponse = serde_json::from_value(json!({
            "cowboys": {"columns": ["id", "version"], "created": [[1, 1]]},
            "horses": {}
        }))
        .unwrap();
        assert_eq!(response.len(), 2);
        assert_eq!(response["cowboys"].created, vec![vec![json!(1), json!(1)]]);
        assert!(response["horses"].columns.is_empty());
    }

    #[test]
    fn transport_reads_config() {
        let config = DatabaseConfig::default().with_synch_url("http://localhost:9/synch");
        let transport = HttpTransport::from_config(&config).unwrap();
        assert_eq!(transport.url(), "http://localhost:9/synch");
    }
}
