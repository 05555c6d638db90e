//! Session credentials consumed by the realtime core.
//!
//! The store itself lives outside this crate (secure storage, login flow); the
//! core only reads the bearer token and online status, and asks for a refresh
//! when the server rejects the token.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use serde::{Serialize, Serializer};

use crate::core::LinkError;

pub type RefreshFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Option<String>, LinkError>> + Send + 'a>>;

/// Driver availability as reported to the dispatch backend.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DriverStatus {
    #[default]
    Online,
    Offline,
    /// Any other backend status (e.g. `BUSY`), passed through unchanged.
    Other(String),
}

impl DriverStatus {
    pub fn as_str(&self) -> &str {
        match self {
            DriverStatus::Online => "ONLINE",
            DriverStatus::Offline => "OFFLINE",
            DriverStatus::Other(status) => status.as_str(),
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "ONLINE" => DriverStatus::Online,
            "OFFLINE" => DriverStatus::Offline,
            other => DriverStatus::Other(other.to_string()),
        }
    }
}

impl Serialize for DriverStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Read-mostly view of the authenticated session.
pub trait CredentialStore: Send + Sync + 'static {
    fn token(&self) -> Option<String>;

    fn driver_status(&self) -> DriverStatus;

    /// Obtain a fresh token after the server rejected the current one.
    ///
    /// `Ok(None)` means the session cannot be renewed silently.
    fn refresh_token(&self) -> RefreshFuture<'_>;
}

pub type SharedCredentials = Arc<dyn CredentialStore>;

#[derive(Debug, Default)]
struct CredentialState {
    token: Option<String>,
    refreshed_token: Option<String>,
    status: DriverStatus,
    refresh_calls: u32,
    refresh_error: Option<String>,
}

/// Simple in-process store, used by tests and by hosts that keep the session in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCredentials {
    state: Arc<Mutex<CredentialState>>,
}

impl InMemoryCredentials {
    pub fn new(token: Option<&str>) -> Self {
        let store = Self::default();
        store.set_token(token);
        store
    }

    pub fn set_token(&self, token: Option<&str>) {
        self.with_state(|state| state.token = token.map(str::to_string));
    }

    pub fn set_status(&self, status: DriverStatus) {
        self.with_state(|state| state.status = status);
    }

    /// Token handed out by the next successful refresh.
    pub fn set_refreshed_token(&self, token: Option<&str>) {
        self.with_state(|state| state.refreshed_token = token.map(str::to_string));
    }

    pub fn fail_refresh_with(&self, error: Option<&str>) {
        self.with_state(|state| state.refresh_error = error.map(str::to_string));
    }

    pub fn refresh_calls(&self) -> u32 {
        self.with_state(|state| state.refresh_calls)
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut CredentialState) -> R) -> R {
        let mut guard = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }
}

impl CredentialStore for InMemoryCredentials {
    fn token(&self) -> Option<String> {
        self.with_state(|state| state.token.clone())
    }

    fn driver_status(&self) -> DriverStatus {
        self.with_state(|state| state.status.clone())
    }

    fn refresh_token(&self) -> RefreshFuture<'_> {
        Box::pin(async move {
            self.with_state(|state| {
                state.refresh_calls += 1;
                if let Some(err) = state.refresh_error.clone() {
                    return Err(LinkError::RefreshFailed(err));
                }
                let fresh = state.refreshed_token.take();
                if let Some(token) = fresh.as_ref() {
                    state.token = Some(token.clone());
                }
                Ok(fresh)
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_as_backend_string() {
        assert_eq!(sonic_rs::to_string(&DriverStatus::Online).unwrap(), "\"ONLINE\"");
        assert_eq!(
            sonic_rs::to_string(&DriverStatus::parse("BUSY")).unwrap(),
            "\"BUSY\""
        );
        assert_eq!(DriverStatus::parse("OFFLINE"), DriverStatus::Offline);
    }

    #[tokio::test]
    async fn refresh_replaces_token_once() {
        let store = InMemoryCredentials::new(Some("old"));
        store.set_refreshed_token(Some("new"));

        assert_eq!(store.refresh_token().await.unwrap().as_deref(), Some("new"));
        assert_eq!(store.token().as_deref(), Some("new"));
        assert_eq!(store.refresh_token().await.unwrap(), None);
        assert_eq!(store.refresh_calls(), 2);
    }

    #[tokio::test]
    async fn refresh_error_is_reported() {
        let store = InMemoryCredentials::new(Some("old"));
        store.fail_refresh_with(Some("refresh endpoint down"));
        assert!(matches!(
            store.refresh_token().await,
            Err(LinkError::RefreshFailed(_))
        ));
    }
}
