//! Query registry: rebuild queries from a JSON request.
//!
//! Each serializable query type declares a `KIND` tag. A request carries the
//! tag, the enqueue options and the query parameters; the registry maps the
//! tag back to a constructor. Replaying a request yields a fresh query, so
//! identity and status are never part of the wire form.

use crate::error::RegistryError;
use crate::queries::{ListPathsQuery, TrackByExternalIdQuery, TrackCountQuery, TrackListQuery};
use crate::query::{DynQuery, Query, QueryHandle, QueryOptions, Tracked};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A query whose parameters round-trip through JSON.
pub trait SerializableQuery: Query + Serialize + DeserializeOwned {
    const KIND: &'static str;

    /// Results of a finished query, for printing.
    fn result_json(&self) -> Value;
}

/// A rebuilt query, erased but still able to report its results.
pub trait ReplayableQuery: DynQuery {
    fn kind(&self) -> &'static str;
    fn result_json(&self) -> Value;
    fn into_dyn(self: Arc<Self>) -> Arc<dyn DynQuery>;
}

impl<Q: SerializableQuery> ReplayableQuery for Tracked<Q> {
    fn kind(&self) -> &'static str {
        Q::KIND
    }

    fn result_json(&self) -> Value {
        self.body().result_json()
    }

    fn into_dyn(self: Arc<Self>) -> Arc<dyn DynQuery> {
        self
    }
}

impl<Q: SerializableQuery> QueryHandle<Q> {
    pub fn into_replayable(self) -> Arc<dyn ReplayableQuery> {
        let tracked: Arc<Tracked<Q>> = Arc::clone(self.tracked());
        tracked
    }
}

/// Wire form of a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub kind: String,
    /// Raw [`QueryOptions`] bits.
    #[serde(default)]
    pub options: u32,
    #[serde(default)]
    pub params: Value,
}

impl QueryRequest {
    pub fn options(&self) -> QueryOptions {
        QueryOptions::from_bits_truncate(self.options)
    }
}

type Factory = fn(Value) -> Result<Arc<dyn ReplayableQuery>, RegistryError>;

fn build<Q: SerializableQuery>(params: Value) -> Result<Arc<dyn ReplayableQuery>, RegistryError> {
    let params = if params.is_null() { json!({}) } else { params };
    let body: Q = serde_json::from_value(params)?;
    Ok(QueryHandle::new(body).into_replayable())
}

#[derive(Default)]
pub struct QueryRegistry {
    factories: BTreeMap<&'static str, Factory>,
}

impl std::fmt::Debug for QueryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl QueryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin_queries() -> Self {
        let mut registry = Self::new();
        registry.register::<ListPathsQuery>();
        registry.register::<TrackListQuery>();
        registry.register::<TrackByExternalIdQuery>();
        registry.register::<TrackCountQuery>();
        registry
    }

    /// Register `Q` under its `KIND`, replacing any previous registration.
    pub fn register<Q: SerializableQuery>(&mut self) {
        self.factories.insert(Q::KIND, build::<Q>);
    }

    pub fn is_registered(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }

    pub fn serialize<Q: SerializableQuery>(
        &self,
        query: &QueryHandle<Q>,
        options: QueryOptions,
    ) -> Result<String, RegistryError> {
        if !self.is_registered(Q::KIND) {
            return Err(RegistryError::UnknownKind(Q::KIND.to_string()));
        }
        let request = QueryRequest {
            kind: Q::KIND.to_string(),
            options: options.bits(),
            params: serde_json::to_value(query.body())?,
        };
        Ok(serde_json::to_string(&request)?)
    }

    pub fn deserialize(
        &self,
        text: &str,
    ) -> Result<(Arc<dyn ReplayableQuery>, QueryOptions), RegistryError> {
        let request: QueryRequest = serde_json::from_str(text)?;
        let query = self.build(&request)?;
        Ok((query, request.options()))
    }

    pub fn build(&self, request: &QueryRequest) -> Result<Arc<dyn ReplayableQuery>, RegistryError> {
        let factory = self
            .factories
            .get(request.kind.as_str())
            .ok_or_else(|| RegistryError::UnknownKind(request.kind.clone()))?;
        factory(request.params.clone())
    }
}

impl SerializableQuery for ListPathsQuery {
    const KIND: &'static str = "list_paths";

    fn result_json(&self) -> Value {
        json!({ "paths": self.paths() })
    }
}

impl SerializableQuery for TrackListQuery {
    const KIND: &'static str = "track_list";

    fn result_json(&self) -> Value {
        json!({ "tracks": self.tracks() })
    }
}

impl SerializableQuery for TrackByExternalIdQuery {
    const KIND: &'static str = "track_by_external_id";

    fn result_json(&self) -> Value {
        json!({ "track": self.track() })
    }
}

impl SerializableQuery for TrackCountQuery {
    const KIND: &'static str = "track_count";

    fn result_json(&self) -> Value {
        json!({ "count": self.count() })
    }
}
