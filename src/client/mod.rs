//! The client facade.
//!
//! [`CouchClient`] owns the transport handle and shared configuration;
//! [`Database`] is a cheap per-database handle carrying every operation of
//! the §6 wire surface: admin, document CRUD, attachments, views, bulk
//! updates, Mango queries, and the change feed. All streaming results are
//! decoded incrementally; dropping a stream cancels its request.

pub mod gate;
pub mod request;

pub use gate::{HeaderRegistry, Missing};
pub use request::RequestBuilder;

use crate::bulk::{BulkDecoder, BulkRequest};
use crate::changes::{ChangeFeed, ChangesOptions, TagResolver, TypedChangeFeed};
use crate::config::ClientConfig;
use crate::design::DesignDocument;
use crate::document::{CouchDocument, DbInfo, RevInfo, RevsInfoEnvelope, SecurityDocument, WriteOk};
use crate::error::{CouchError, Result};
use crate::json::TokenSource;
use crate::mango::{MangoDecoder, MangoQuery};
use crate::replicator::{ActiveTask, Replicator};
use crate::transport::{HttpResponse, HttpTransport, PreparedRequest, ReqwestTransport};
use crate::view::batch::{run_batches, BatchedAllDocs};
use crate::view::decoder::ViewDecoder;
use crate::view::ViewQuery;
use bytes::Bytes;
use futures::Stream;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;

/// Entry point: owns the transport and the shared configuration.
///
/// Cloning is cheap; all clones share one connection pool. The client is
/// immutable once handed out — register header handlers before the first
/// request.
#[derive(Clone)]
pub struct CouchClient {
    transport: Arc<dyn HttpTransport>,
    config: Arc<ClientConfig>,
    registry: Arc<HeaderRegistry>,
}

impl CouchClient {
    /// Build a client with the production transport.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let transport = Arc::new(ReqwestTransport::from_config(&config)?);
        Ok(Self::with_transport(config, transport))
    }

    /// Build a client over a caller-supplied transport (tests, custom
    /// stacks).
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn HttpTransport>) -> Self {
        CouchClient {
            transport,
            config: Arc::new(config),
            registry: Arc::new(HeaderRegistry::new()),
        }
    }

    /// Register a response-header handler matched by name prefix.
    pub fn register_header_handler<F>(&mut self, prefix: impl Into<String>, handler: F)
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.registry).register(prefix, handler);
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Handle for the configured database.
    pub fn db(&self) -> Database {
        self.database(self.config.database.clone())
    }

    /// Handle for an arbitrary database.
    pub fn database(&self, name: impl Into<String>) -> Database {
        Database {
            client: self.clone(),
            name: name.into(),
        }
    }

    /// Handle for the root-level replication endpoints.
    pub fn replicator(&self) -> Replicator {
        Replicator::new(self.clone())
    }

    /// List the server's running tasks.
    pub async fn active_tasks(&self) -> Result<Vec<ActiveTask>> {
        let request = self.request()?.segment("_active_tasks").build()?;
        self.send_json(request, Missing::Error)
            .await?
            .ok_or(CouchError::NotFound)
    }

    pub(crate) fn request(&self) -> Result<RequestBuilder> {
        RequestBuilder::from_config(&self.config)
    }

    /// Execute and triage one request.
    pub(crate) async fn send(
        &self,
        request: PreparedRequest,
        missing: Missing,
    ) -> Result<Option<HttpResponse>> {
        tracing::debug!(method = %request.method, url = %request.url, "dispatching");
        let response = self.transport.execute(request).await?;
        gate::triage(response, missing, &self.registry).await
    }

    /// Execute, triage, and decode a small JSON payload.
    pub(crate) async fn send_json<T: DeserializeOwned>(
        &self,
        request: PreparedRequest,
        missing: Missing,
    ) -> Result<Option<T>> {
        match self.send(request, missing).await? {
            None => Ok(None),
            Some(response) => {
                let body = response.collect_body().await?;
                Ok(Some(serde_json::from_slice(&body)?))
            }
        }
    }

    /// Execute, triage, and hand back the body as a token source.
    pub(crate) async fn send_streaming(&self, request: PreparedRequest) -> Result<TokenSource> {
        let response = self
            .send(request, Missing::Error)
            .await?
            .ok_or(CouchError::NotFound)?;
        Ok(TokenSource::new(response.body))
    }
}

impl std::fmt::Debug for CouchClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CouchClient")
            .field("base_url", &self.config.base_url)
            .field("database", &self.config.database)
            .finish()
    }
}

/// Acknowledgement for operations whose payload is just `{"ok": true}`.
#[derive(Debug, serde::Deserialize)]
struct OkStatus {
    #[serde(default)]
    ok: bool,
}

#[derive(Debug, serde::Deserialize)]
struct DesignDocsRow {
    id: String,
}

#[derive(Debug, serde::Deserialize)]
struct DesignDocsResponse {
    #[serde(default)]
    rows: Vec<DesignDocsRow>,
}

/// Per-database handle.
#[derive(Clone, Debug)]
pub struct Database {
    client: CouchClient,
    name: String,
}

impl Database {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn request(&self) -> Result<RequestBuilder> {
        Ok(self.client.request()?.segment(&self.name))
    }

    /// Execute a request whose payload is just an acknowledgement.
    async fn send_ok(&self, request: PreparedRequest) -> Result<()> {
        let status: OkStatus = self
            .client
            .send_json(request, Missing::Error)
            .await?
            .ok_or(CouchError::NotFound)?;
        if !status.ok {
            tracing::warn!(database = %self.name, "server acknowledged without ok flag");
        }
        Ok(())
    }

    // ---- database administration ----

    /// Probe for existence without erroring on absence.
    pub async fn exists(&self) -> Result<bool> {
        let request = self.request()?.build()?;
        Ok(self.client.send(request, Missing::Absent).await?.is_some())
    }

    pub async fn info(&self) -> Result<DbInfo> {
        let request = self.request()?.build()?;
        self.client
            .send_json(request, Missing::Error)
            .await?
            .ok_or(CouchError::NotFound)
    }

    /// Create the database with default sharding.
    pub async fn create(&self) -> Result<()> {
        self.create_with(None, None).await
    }

    /// Create the database with explicit shard (`q`) and replica (`n`)
    /// counts.
    pub async fn create_with(&self, shards: Option<u32>, replicas: Option<u32>) -> Result<()> {
        let mut builder = self.request()?.method("PUT");
        if let Some(q) = shards {
            builder = builder.query("q", q);
        }
        if let Some(n) = replicas {
            builder = builder.query("n", n);
        }
        self.send_ok(builder.build()?).await
    }

    pub async fn destroy(&self) -> Result<()> {
        let request = self.request()?.method("DELETE").build()?;
        self.send_ok(request).await
    }

    pub async fn update_security(&self, security: &SecurityDocument) -> Result<()> {
        let request = self
            .request()?
            .segment("_security")
            .method("PUT")
            .body_json(security)?
            .build()?;
        self.send_ok(request).await
    }

    /// Ids of all design documents in this database.
    pub async fn list_design_docs(&self) -> Result<Vec<String>> {
        let request = self.request()?.segment("_design_docs").build()?;
        let response: DesignDocsResponse = self
            .client
            .send_json(request, Missing::Error)
            .await?
            .ok_or(CouchError::NotFound)?;
        Ok(response.rows.into_iter().map(|row| row.id).collect())
    }

    // ---- single-document CRUD ----

    /// Fetch a document; `None` when it does not exist.
    pub async fn get<T: DeserializeOwned>(&self, id: &str) -> Result<Option<T>> {
        let request = self.request()?.segment(id).build()?;
        self.client.send_json(request, Missing::Absent).await
    }

    /// Fetch a document's revision history; `None` when it does not
    /// exist.
    pub async fn get_revs_info(&self, id: &str) -> Result<Option<Vec<RevInfo>>> {
        let request = self
            .request()?
            .segment(id)
            .query("revs_info", true)
            .build()?;
        let envelope: Option<RevsInfoEnvelope> =
            self.client.send_json(request, Missing::Absent).await?;
        Ok(envelope.map(|e| e.revs_info))
    }

    /// Create or update a document. The server-assigned revision is
    /// written back into the document and returned.
    pub async fn put<T: CouchDocument>(&self, doc: &mut T) -> Result<String> {
        let request = self
            .request()?
            .segment(doc.id())
            .method("PUT")
            .body_json(doc)?
            .build()?;
        let ack: WriteOk = self
            .client
            .send_json(request, Missing::Error)
            .await?
            .ok_or(CouchError::NotFound)?;
        doc.set_rev(ack.rev.clone());
        Ok(ack.rev)
    }

    /// Delete a revision of a document; returns the tombstone revision.
    pub async fn delete(&self, id: &str, rev: &str) -> Result<String> {
        let request = self
            .request()?
            .segment(id)
            .method("DELETE")
            .query("rev", rev)
            .build()?;
        let ack: WriteOk = self
            .client
            .send_json(request, Missing::Error)
            .await?
            .ok_or(CouchError::NotFound)?;
        Ok(ack.rev)
    }

    // ---- attachments ----

    pub async fn put_attachment(
        &self,
        id: &str,
        rev: &str,
        name: &str,
        content_type: &str,
        data: Bytes,
    ) -> Result<WriteOk> {
        let request = self
            .request()?
            .segment(id)
            .segment(name)
            .method("PUT")
            .query("rev", rev)
            .body_bytes(data, content_type)
            .build()?;
        self.client
            .send_json(request, Missing::Error)
            .await?
            .ok_or(CouchError::NotFound)
    }

    /// Fetch attachment bytes; `None` when the document or attachment
    /// does not exist.
    pub async fn get_attachment(&self, id: &str, name: &str) -> Result<Option<Bytes>> {
        let request = self.request()?.segment(id).segment(name).build()?;
        match self.client.send(request, Missing::Absent).await? {
            None => Ok(None),
            Some(response) => Ok(Some(response.collect_body().await?)),
        }
    }

    pub async fn delete_attachment(&self, id: &str, rev: &str, name: &str) -> Result<WriteOk> {
        let request = self
            .request()?
            .segment(id)
            .segment(name)
            .method("DELETE")
            .query("rev", rev)
            .build()?;
        self.client
            .send_json(request, Missing::Error)
            .await?
            .ok_or(CouchError::NotFound)
    }

    // ---- design documents ----

    /// Fetch a design document by full id (`_design/...`); `None` when
    /// absent.
    pub async fn get_design_document(&self, id: &str) -> Result<Option<DesignDocument>> {
        let request = self.request()?.segment(id).build()?;
        self.client.send_json(request, Missing::Absent).await
    }

    pub async fn put_design_document(&self, doc: &DesignDocument) -> Result<WriteOk> {
        let request = self
            .request()?
            .segment(&doc.id)
            .method("PUT")
            .body_json(doc)?
            .build()?;
        self.client
            .send_json(request, Missing::Error)
            .await?
            .ok_or(CouchError::NotFound)
    }

    // ---- streaming reads ----

    /// Execute a view query, returning its streaming decoder.
    ///
    /// More than one key switches the request to a POST with a
    /// `{"keys": [...]}` body; everything else travels in the query
    /// string.
    pub async fn query_view<K, V, T>(&self, query: &ViewQuery) -> Result<ViewDecoder<K, V, T>>
    where
        K: DeserializeOwned,
        V: DeserializeOwned,
        T: DeserializeOwned,
    {
        let mut builder = self.request()?.segment(query.path()).streaming();

        if let Some(key) = &query.start_key {
            builder = builder.query_json("startkey", key)?;
        }
        if let Some(key) = &query.end_key {
            builder = builder.query_json("endkey", key)?;
        }
        if !query.inclusive_end {
            builder = builder.query("inclusive_end", false);
        }
        if let Some(key) = &query.key {
            builder = builder.query_json("key", key)?;
        }
        if query.keys.len() == 1 {
            builder = builder.query_json("key", &query.keys[0])?;
        }
        if let Some(limit) = query.limit {
            builder = builder.query("limit", limit);
        }
        if let Some(skip) = query.skip {
            builder = builder.query("skip", skip);
        }
        if query.descending {
            builder = builder.query("descending", true);
        }
        if query.include_docs {
            builder = builder.query("include_docs", true);
        }
        if let Some(reduce) = query.reduce {
            builder = builder.query("reduce", reduce);
        }
        if let Some(level) = query.group_level {
            builder = builder.query("group", true).query("group_level", level);
        }
        if let Some(stale) = query.stale {
            builder = builder.query("stale", stale.as_param());
        }
        if query.update_seq {
            builder = builder.query("update_seq", true);
        }

        if query.is_multi_key() {
            builder = builder
                .method("POST")
                .body_json(&serde_json::json!({"keys": &query.keys}))?;
        }

        let source = self.client.send_streaming(builder.build()?).await?;
        Ok(ViewDecoder::new(
            source,
            query.include_docs,
            query.ignore_not_found,
        ))
    }

    /// Fetch documents for an unbounded sequence of ids in bounded keyed
    /// `_all_docs` batches (`include_docs=true`, `ignore_not_found=true`).
    pub fn all_docs_batched<T, S>(&self, ids: S) -> BatchedAllDocs<T>
    where
        T: DeserializeOwned + Send + 'static,
        S: Stream<Item = String> + Send + 'static,
    {
        let (tx, rx) = async_channel::bounded(self.client.config.stream_buffer.max(1));
        let db = self.clone();
        let batch_size = self.client.config.batch_size;
        let fetch = move |keys: Vec<String>| {
            let db = db.clone();
            async move {
                let query = ViewQuery::all_docs()
                    .keys(keys)
                    .include_docs(true)
                    .ignore_not_found(true)
                    .update_seq(true);
                db.query_view::<Value, Value, T>(&query).await
            }
        };
        let task = tokio::spawn(run_batches(ids, batch_size, fetch, tx));
        BatchedAllDocs::new(rx, task)
    }

    /// Submit bulk actions, returning the streaming per-document results.
    pub async fn bulk_docs(&self, request: &BulkRequest) -> Result<BulkDecoder> {
        let prepared = self
            .request()?
            .segment("_bulk_docs")
            .method("POST")
            .body_json(request)?
            .streaming()
            .build()?;
        let source = self.client.send_streaming(prepared).await?;
        Ok(BulkDecoder::new(source))
    }

    /// Run a Mango query, returning the streaming decoder.
    pub async fn find<T: DeserializeOwned>(&self, query: &MangoQuery) -> Result<MangoDecoder<T>> {
        let prepared = self
            .request()?
            .segment("_find")
            .method("POST")
            .body_json(query)?
            .streaming()
            .build()?;
        let source = self.client.send_streaming(prepared).await?;
        Ok(MangoDecoder::new(source))
    }

    // ---- change feed ----

    /// Subscribe to the continuous change feed, receiving every envelope.
    pub fn changes(&self, options: ChangesOptions) -> ChangeFeed {
        ChangeFeed::spawn(
            self.client.transport.clone(),
            self.client.config.clone(),
            self.client.registry.clone(),
            self.name.clone(),
            options,
        )
    }

    /// Subscribe to changes of one application type.
    ///
    /// `discriminator` names the document field carrying the type tag;
    /// `resolver` decides which tags belong to `T`. Changes whose tag is
    /// unresolvable or whose document cannot be materialized as `T` are
    /// dropped silently.
    pub fn changes_typed<T: DeserializeOwned>(
        &self,
        options: ChangesOptions,
        discriminator: impl Into<String>,
        resolver: TagResolver,
    ) -> TypedChangeFeed<T> {
        TypedChangeFeed::new(self.changes(options), discriminator.into(), resolver)
    }
}
