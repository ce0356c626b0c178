//! Shared session context threaded through every component.

use std::sync::Arc;

use crate::client::{ProviderInfo, QueryClient, TxClient};

/// Provider identity plus chain client handles. Cheap to clone; the
/// clients are individually safe for concurrent use.
#[derive(Clone)]
pub struct Session {
    provider: ProviderInfo,
    query: Arc<dyn QueryClient>,
    tx: Arc<dyn TxClient>,
}

impl Session {
    pub fn new(provider: ProviderInfo, query: Arc<dyn QueryClient>, tx: Arc<dyn TxClient>) -> Self {
        Self { provider, query, tx }
    }

    pub fn provider(&self) -> &ProviderInfo {
        &self.provider
    }

    pub fn provider_address(&self) -> &str {
        &self.provider.address
    }

    pub fn query(&self) -> &Arc<dyn QueryClient> {
        &self.query
    }

    pub fn tx(&self) -> &Arc<dyn TxClient> {
        &self.tx
    }
}
