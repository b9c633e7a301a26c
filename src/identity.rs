//! Identity collaborator and credential refresh state.

use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::SyncResult;
use crate::storage::KeyValueStore;

pub const FINGERPRINT_KEY: &str = "session:fingerprint";

/// Answers "who is acting right now". Must be cheap and synchronous.
pub trait IdentityProvider: Send + Sync {
  fn current_identity(&self) -> Option<String>;
}

/// Stable anonymous identity derived from device characteristics.
pub fn anonymous_fingerprint(components: &[&str]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(components.join("|").as_bytes());
  format!("anon-{}", hex::encode(hasher.finalize()))
}

/// The fingerprint stored in `kv`, created from `components` on first use.
/// Later calls return the stored value even if the components drift.
pub fn stored_fingerprint(kv: &dyn KeyValueStore, components: &[&str]) -> SyncResult<String> {
  if let Some(existing) = kv.get(FINGERPRINT_KEY)? {
    return Ok(existing);
  }
  let fingerprint = anonymous_fingerprint(components);
  kv.set(FINGERPRINT_KEY, &fingerprint)?;
  debug!("created anonymous fingerprint");
  Ok(fingerprint)
}

pub fn forget_fingerprint(kv: &dyn KeyValueStore) -> SyncResult<()> {
  kv.remove(FINGERPRINT_KEY)
}

/// Whether a credential renewal is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
  Idle,
  Refreshing,
}

/// Lets exactly one caller renew credentials while everybody else who hit
/// an expired credential waits for that renewal's outcome.
#[derive(Clone)]
pub struct RefreshGate {
  state: Arc<watch::Sender<RefreshState>>,
  last: Arc<Mutex<Option<SyncResult<()>>>>,
}

impl Default for RefreshGate {
  fn default() -> Self {
    Self::new()
  }
}

impl RefreshGate {
  pub fn new() -> Self {
    let (state, _) = watch::channel(RefreshState::Idle);
    Self {
      state: Arc::new(state),
      last: Arc::default(),
    }
  }

  pub fn state(&self) -> RefreshState {
    *self.state.borrow()
  }

  /// Run `renew` unless a renewal is already underway, in which case wait
  /// for it and share its result.
  pub async fn renew<F, Fut>(&self, renew: F) -> SyncResult<()>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = SyncResult<()>>,
  {
    let leader = self.state.send_if_modified(|state| match state {
      RefreshState::Idle => {
        *state = RefreshState::Refreshing;
        true
      }
      RefreshState::Refreshing => false,
    });

    if !leader {
      debug!("waiting for credential renewal in progress");
      let mut rx = self.state.subscribe();
      // The sender lives in `self`, so the channel cannot close here.
      let _ = rx.wait_for(|s| *s == RefreshState::Idle).await;
      return self.last_result();
    }

    let reset = ResetOnDrop(&self.state);
    info!("renewing credentials");
    let result = renew().await;
    *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Some(result.clone());
    drop(reset);
    result
  }

  fn last_result(&self) -> SyncResult<()> {
    self
      .last
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .clone()
      .unwrap_or(Ok(()))
  }
}

/// Returns the gate to `Idle` even when the renewing future is dropped.
struct ResetOnDrop<'a>(&'a watch::Sender<RefreshState>);

impl Drop for ResetOnDrop<'_> {
  fn drop(&mut self) {
    self.0.send_replace(RefreshState::Idle);
  }
}

/// Identity held by the running application: the signed-in username, an
/// anonymous fingerprint, or nothing yet. Carries the refresh state of
/// that identity's credentials.
#[derive(Default)]
pub struct SessionIdentity {
  current: RwLock<Option<String>>,
  refresh: RefreshGate,
}

impl SessionIdentity {
  pub fn new(identity: Option<&str>) -> Self {
    Self {
      current: RwLock::new(identity.map(String::from)),
      refresh: RefreshGate::new(),
    }
  }

  pub fn set(&self, identity: Option<&str>) {
    *self.current.write().unwrap_or_else(|e| e.into_inner()) = identity.map(String::from);
  }

  pub fn refresh_gate(&self) -> &RefreshGate {
    &self.refresh
  }
}

impl IdentityProvider for SessionIdentity {
  fn current_identity(&self) -> Option<String> {
    self
      .current
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .clone()
  }
}
