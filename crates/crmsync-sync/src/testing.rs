//! In-crate fakes for the CRM collaborators.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use crmsync_core::{AccessToken, RawRecord};
use crmsync_crm::{CredentialError, CredentialProvider, FetchError, QueryDescriptor, RecordFetcher};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behavior {
    Grant,
    Refuse,
    Panic,
}

#[derive(Debug, Clone)]
pub struct FakeCredentials {
    behavior: Behavior,
    calls: Arc<AtomicUsize>,
}

impl FakeCredentials {
    fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            calls: Arc::default(),
        }
    }

    pub fn ok() -> Self {
        Self::new(Behavior::Grant)
    }

    pub fn failing() -> Self {
        Self::new(Behavior::Refuse)
    }

    pub fn panicking() -> Self {
        Self::new(Behavior::Panic)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialProvider for FakeCredentials {
    async fn acquire(&self) -> Result<AccessToken, CredentialError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            Behavior::Grant => Ok(AccessToken::new("tok-test")),
            Behavior::Refuse => Err(CredentialError::MissingToken {
                body: r#"{"error":"invalid_code"}"#.into(),
            }),
            Behavior::Panic => panic!("credential provider blew up"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeFetcher {
    records: Vec<RawRecord>,
    related: HashMap<(String, String), Vec<RawRecord>>,
    fail: bool,
    failing_related: Option<String>,
    calls: Arc<AtomicUsize>,
}

fn to_records(values: Vec<JsonValue>) -> Vec<RawRecord> {
    values
        .into_iter()
        .map(|v| serde_json::from_value(v).unwrap())
        .collect()
}

impl FakeFetcher {
    pub fn with_records(records: Vec<JsonValue>) -> Self {
        Self {
            records: to_records(records),
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn related(mut self, module: &str, parent_id: &str, records: Vec<JsonValue>) -> Self {
        self.related
            .insert((module.to_string(), parent_id.to_string()), to_records(records));
        self
    }

    /// Every related lookup against `module` fails with an HTTP error.
    pub fn failing_related(mut self, module: &str) -> Self {
        self.failing_related = Some(module.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordFetcher for FakeFetcher {
    async fn fetch(
        &self,
        _token: &AccessToken,
        query: &QueryDescriptor,
    ) -> Result<Vec<RawRecord>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(FetchError::HttpStatus {
                status: 401,
                url: format!("fake://coql/{}", query.module),
                body: r#"{"code":"INVALID_TOKEN"}"#.into(),
            });
        }
        Ok(self.records.clone())
    }

    async fn fetch_related(
        &self,
        _token: &AccessToken,
        module: &str,
        parent_id: &str,
    ) -> Result<Vec<RawRecord>, FetchError> {
        if self.failing_related.as_deref() == Some(module) {
            return Err(FetchError::HttpStatus {
                status: 500,
                url: format!("fake://{module}/search?parent={parent_id}"),
                body: r#"{"code":"INTERNAL_ERROR"}"#.into(),
            });
        }
        Ok(self
            .related
            .get(&(module.to_string(), parent_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}
