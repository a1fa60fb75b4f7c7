//! Write authorization for cluster-scoped operations
//!
//! Policy evaluation lives outside the control plane; only the boolean answer
//! is used here.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthorizationError {
    #[error("Authorization backend unavailable: {0}")]
    Unavailable(String),
}

/// Identity of the caller of a manager operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub principal: String,
}

impl RequestContext {
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
        }
    }
}

#[async_trait]
pub trait WriteAuthorizer: Send + Sync + Debug {
    async fn write_allowed(
        &self,
        ctx: &RequestContext,
        cluster_id: &str,
    ) -> Result<bool, AuthorizationError>;
}

/// Allows every write
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl WriteAuthorizer for AllowAll {
    async fn write_allowed(
        &self,
        _ctx: &RequestContext,
        _cluster_id: &str,
    ) -> Result<bool, AuthorizationError> {
        Ok(true)
    }
}

/// Which clusters a principal may modify
#[derive(Debug, Clone)]
enum Grant {
    AllClusters,
    Clusters(HashSet<String>),
}

/// Fixed grants per principal
#[derive(Debug, Clone, Default)]
pub struct StaticAuthorizer {
    grants: HashMap<String, Grant>,
}

impl StaticAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(mut self, principal: impl Into<String>, cluster_id: impl Into<String>) -> Self {
        let grant = self
            .grants
            .entry(principal.into())
            .or_insert_with(|| Grant::Clusters(HashSet::new()));
        if let Grant::Clusters(clusters) = grant {
            clusters.insert(cluster_id.into());
        }
        self
    }

    pub fn allow_all_clusters(mut self, principal: impl Into<String>) -> Self {
        self.grants.insert(principal.into(), Grant::AllClusters);
        self
    }
}

#[async_trait]
impl WriteAuthorizer for StaticAuthorizer {
    async fn write_allowed(
        &self,
        ctx: &RequestContext,
        cluster_id: &str,
    ) -> Result<bool, AuthorizationError> {
        Ok(match self.grants.get(&ctx.principal) {
            Some(Grant::AllClusters) => true,
            Some(Grant::Clusters(clusters)) => clusters.contains(cluster_id),
            None => false,
        })
    }
}
