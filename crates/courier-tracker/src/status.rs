//! Delivery status lookups against the logistics API.
//!
//! The server is authoritative for delivery status. Lookups distinguish a
//! definite "not found" from failures whose meaning is unknown, so that the
//! reconciler never discards state on an ambiguous answer.

use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::channel::Credential;
use crate::error::{Error, Result};
use crate::tracking::{DeliveryId, DeliveryStatus};

/// Failures of a status lookup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatusQueryError {
    /// The server does not know the delivery.
    #[error("delivery not found")]
    NotFound,

    /// The lookup failed for a reason that may not persist.
    #[error("transient status lookup failure: {0}")]
    Transient(String),
}

impl StatusQueryError {
    /// Convert into the crate error for `delivery_id`.
    #[must_use]
    pub fn into_error(self, delivery_id: &DeliveryId) -> Error {
        match self {
            Self::NotFound => Error::DeliveryNotFound(delivery_id.clone()),
            Self::Transient(message) => Error::StatusQuery(message),
        }
    }
}

/// Read-only lookup of a delivery's server-side status.
#[async_trait::async_trait]
pub trait DeliveryStatusQuery: Send + Sync {
    /// Fetch the current status of `delivery_id`, authenticated as `credential`.
    ///
    /// Must be idempotent and free of side effects.
    async fn delivery_status(
        &self,
        credential: &Credential,
        delivery_id: &DeliveryId,
    ) -> std::result::Result<DeliveryStatus, StatusQueryError>;
}

#[derive(Debug, Deserialize)]
struct DeliveryBody {
    status: DeliveryStatus,
}

/// HTTP client for `GET {base_url}/deliveries/{id}`.
#[derive(Debug, Clone)]
pub struct HttpStatusClient {
    base_url: Url,
    client: reqwest::Client,
}

impl HttpStatusClient {
    /// Create a client rooted at `base_url` with a per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::status_query(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { base_url, client })
    }

    /// The URL queried for a delivery.
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL cannot carry path segments.
    pub fn delivery_url(&self, delivery_id: &DeliveryId) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| Error::status_query(format!("base URL {} cannot be a base", self.base_url)))?
            .pop_if_empty()
            .push("deliveries")
            .push(delivery_id.as_str());
        Ok(url)
    }
}

#[async_trait::async_trait]
impl DeliveryStatusQuery for HttpStatusClient {
    async fn delivery_status(
        &self,
        credential: &Credential,
        delivery_id: &DeliveryId,
    ) -> std::result::Result<DeliveryStatus, StatusQueryError> {
        let url = self
            .delivery_url(delivery_id)
            .map_err(|e| StatusQueryError::Transient(e.to_string()))?;

        debug!(%url, "Querying delivery status");
        let response = self
            .client
            .get(url)
            .bearer_auth(credential.expose())
            .send()
            .await
            .map_err(|e| StatusQueryError::Transient(e.to_string()))?;

        classify(response.status())?;
        let body: DeliveryBody = response
            .json()
            .await
            .map_err(|e| StatusQueryError::Transient(format!("undecodable status body: {e}")))?;
        Ok(body.status)
    }
}

/// Map an HTTP status onto the lookup outcome.
///
/// Only 404 is definite; authentication failures and server errors say
/// nothing about the delivery itself.
fn classify(status: StatusCode) -> std::result::Result<(), StatusQueryError> {
    if status.is_success() {
        Ok(())
    } else if status == StatusCode::NOT_FOUND {
        Err(StatusQueryError::NotFound)
    } else {
        Err(StatusQueryError::Transient(format!("server answered {status}")))
    }
}
