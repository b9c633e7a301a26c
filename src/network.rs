//! Network collaborator boundary.
//!
//! The engine never speaks HTTP itself. A [`Transport`] delivers a
//! [`RequestDescriptor`] and hands back the raw JSON body; this module
//! validates the response envelope, maps partition keys to requests, and
//! renews credentials once when the server rejects them.

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::{
  CacheValue, CollectionRegistry, Entity, FilterValue, Fetcher, Page, PartitionKey, Shape,
};
use crate::error::{SyncError, SyncResult};
use crate::identity::RefreshGate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Post,
  Put,
  Delete,
}

/// Everything a transport needs to issue one call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestDescriptor {
  pub method: Method,
  /// Resource path relative to the API root (e.g. `prayers/42/pray`)
  pub resource: String,
  pub params: BTreeMap<String, FilterValue>,
  pub body: Option<Value>,
}

impl RequestDescriptor {
  pub fn new(method: Method, resource: impl Into<String>) -> Self {
    Self {
      method,
      resource: resource.into(),
      params: BTreeMap::new(),
      body: None,
    }
  }

  pub fn get(resource: impl Into<String>) -> Self {
    Self::new(Method::Get, resource)
  }

  pub fn post(resource: impl Into<String>, body: Value) -> Self {
    Self::new(Method::Post, resource).with_body(body)
  }

  pub fn delete(resource: impl Into<String>) -> Self {
    Self::new(Method::Delete, resource)
  }

  pub fn with_param(mut self, name: impl Into<String>, value: impl Into<FilterValue>) -> Self {
    self.params.insert(name.into(), value.into());
    self
  }

  pub fn with_body(mut self, body: Value) -> Self {
    self.body = Some(body);
    self
  }

  /// Read request for one page of a partition: the collection is the
  /// resource and the filters become query parameters.
  pub fn for_partition(key: &PartitionKey, page: u32) -> Self {
    let mut request = Self::get(key.collection());
    request.params = key.filters().clone();
    request.with_param("page", page)
  }
}

/// Delivers requests. Implementations map transport failures onto
/// [`SyncError`], typically through [`SyncError::from_status`].
pub trait Transport: Send + Sync {
  fn send(&self, request: RequestDescriptor) -> BoxFuture<'static, SyncResult<Value>>;
}

/// The single response shape every endpoint answers with.
#[derive(Debug, Deserialize)]
struct Envelope {
  success: bool,
  #[serde(default)]
  data: Option<Value>,
  #[serde(default)]
  message: Option<String>,
  #[serde(default)]
  detail: Option<String>,
}

impl Envelope {
  fn parse(body: Value) -> SyncResult<Self> {
    let envelope: Envelope = serde_json::from_value(body)
      .map_err(|e| SyncError::server(format!("unexpected response shape: {}", e)))?;

    if !envelope.success {
      let message = envelope
        .message
        .or(envelope.detail)
        .unwrap_or_else(|| "request failed".to_string());
      return Err(SyncError::server(message));
    }
    Ok(envelope)
  }
}

/// Validate an envelope and decode its `data`.
pub fn decode<T: DeserializeOwned>(body: Value) -> SyncResult<T> {
  let data = Envelope::parse(body)?
    .data
    .ok_or_else(|| SyncError::server("response carried no data"))?;
  serde_json::from_value(data)
    .map_err(|e| SyncError::server(format!("unexpected response data: {}", e)))
}

/// Validate an envelope whose payload, if any, is not needed.
pub fn decode_ack(body: Value) -> SyncResult<Option<String>> {
  Ok(Envelope::parse(body)?.message)
}

/// Paged list payload: `{items, page, limit, total?}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ListPayload<T> {
  pub items: Vec<T>,
  pub page: u32,
  pub limit: u32,
  #[serde(default)]
  pub total: Option<u64>,
}

impl ListPayload<Entity> {
  /// A full page means the server may have more.
  pub fn into_page(self) -> Page {
    let has_more = self.limit > 0 && self.items.len() >= self.limit as usize;
    Page {
      items: self.items,
      page: self.page,
      has_more,
    }
  }
}

/// Background reads served by a [`Transport`].
pub struct TransportFetcher {
  transport: Arc<dyn Transport>,
  collections: CollectionRegistry,
}

impl TransportFetcher {
  pub fn new(transport: Arc<dyn Transport>, collections: CollectionRegistry) -> Self {
    Self {
      transport,
      collections,
    }
  }
}

impl Fetcher for TransportFetcher {
  fn fetch(&self, key: &PartitionKey, page: u32) -> BoxFuture<'static, SyncResult<CacheValue>> {
    let shape = self.collections.get(key.collection()).shape.clone();
    let request = RequestDescriptor::for_partition(key, page);
    let response = self.transport.send(request);

    Box::pin(async move {
      let body = response.await?;
      match shape {
        Shape::List => {
          let payload: ListPayload<Entity> = decode(body)?;
          Ok(CacheValue::Pages(vec![payload.into_page()]))
        }
        Shape::Detail { .. } => Ok(CacheValue::Entity(decode(body)?)),
      }
    })
  }
}

/// External authentication collaborator.
pub trait Authenticator: Send + Sync {
  /// Obtain fresh credentials. Any error means the session cannot be
  /// continued.
  fn renew(&self) -> BoxFuture<'static, SyncResult<()>>;
}

/// Transport wrapper that renews credentials on `Auth` failures and
/// retries the request once.
///
/// Concurrent callers that hit an expired credential share one renewal
/// through the [`RefreshGate`]. A failed renewal surfaces as
/// [`SyncError::SessionExpired`].
#[derive(Clone)]
pub struct AuthenticatedTransport {
  inner: Arc<dyn Transport>,
  authenticator: Arc<dyn Authenticator>,
  gate: RefreshGate,
}

impl AuthenticatedTransport {
  pub fn new(
    inner: Arc<dyn Transport>,
    authenticator: Arc<dyn Authenticator>,
    gate: RefreshGate,
  ) -> Self {
    Self {
      inner,
      authenticator,
      gate,
    }
  }
}

impl Transport for AuthenticatedTransport {
  fn send(&self, request: RequestDescriptor) -> BoxFuture<'static, SyncResult<Value>> {
    let this = self.clone();
    Box::pin(async move {
      match this.inner.send(request.clone()).await {
        Err(SyncError::Auth { message }) => {
          debug!(resource = %request.resource, %message, "credentials rejected");
          let authenticator = this.authenticator.clone();
          if let Err(e) = this.gate.renew(|| authenticator.renew()).await {
            warn!(error = %e, "credential renewal failed");
            return Err(SyncError::SessionExpired);
          }
          this.inner.send(request).await
        }
        other => other,
      }
    })
  }
}
