//! Session construction for one keyspace.

use std::sync::Arc;

use chaingraph_common::storage::StorageError;
use scylla::{statement::Consistency, ExecutionProfile, Session, SessionBuilder};
use tracing::info;

use crate::map_query_error;

/// A connected session scoped to one keyspace.
#[derive(Clone)]
pub struct StoreSession {
    pub(crate) session: Arc<Session>,
    keyspace: String,
}

impl StoreSession {
    /// Connects to the given nodes and switches to `keyspace`.
    ///
    /// Reads and writes run at `LOCAL_QUORUM`; the writer never reports
    /// success before acknowledgement at that level.
    pub async fn connect(nodes: &[String], keyspace: &str) -> Result<Self, StorageError> {
        let profile = ExecutionProfile::builder()
            .consistency(Consistency::LocalQuorum)
            .build();
        let mut builder = SessionBuilder::new().default_execution_profile_handle(profile.into_handle());
        for node in nodes {
            builder = builder.known_node(node);
        }
        let session = builder
            .build()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        info!(?nodes, keyspace, "Connected to store");

        session
            .use_keyspace(keyspace, false)
            .await
            .map_err(map_query_error)?;

        Ok(Self { session: Arc::new(session), keyspace: keyspace.to_string() })
    }

    /// Connects without selecting a keyspace; used by schema creation.
    pub async fn connect_unscoped(nodes: &[String]) -> Result<Self, StorageError> {
        let mut builder = SessionBuilder::new();
        for node in nodes {
            builder = builder.known_node(node);
        }
        let session = builder
            .build()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        Ok(Self { session: Arc::new(session), keyspace: String::new() })
    }

    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }
}
