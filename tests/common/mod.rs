//! In-process mock of the CouchDB HTTP surface.
//!
//! Backs the integration tests with just enough server behavior to drive
//! the client end to end: revision-checked document storage, keyed
//! `_all_docs`, bulk updates, a canned view, a live continuous `_changes`
//! stream with a kill switch for resilience tests, `_find`, and the
//! replicator/scheduler endpoints.

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post, put};
use axum::{Json, Router};
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Db {
    docs: HashMap<String, Value>,
}

#[derive(Clone)]
struct ChangeRecord {
    seq: u64,
    line: String,
}

#[derive(Default)]
pub struct MockCouch {
    dbs: Mutex<HashMap<String, Db>>,
    seq: AtomicU64,
    changes: Mutex<Vec<ChangeRecord>>,
    live: Mutex<Vec<async_channel::Sender<String>>>,
    /// When set, the next `_changes` connection is severed after this many
    /// lines.
    pub drop_changes_after: AtomicUsize,
    /// Every `since` value `_changes` was asked for.
    pub since_log: Mutex<Vec<String>>,
    /// Number of design-document PUTs, for reconciler idempotence checks.
    pub design_puts: AtomicUsize,
}

impl MockCouch {
    fn next_rev(current: Option<&str>) -> String {
        let generation = current
            .and_then(|rev| rev.split('-').next())
            .and_then(|n| n.parse::<u64>().ok())
            .unwrap_or(0);
        format!("{}-{:08x}", generation + 1, generation.wrapping_add(0xfeed))
    }

    fn record_change(&self, id: &str, rev: &str, deleted: bool, doc: Option<&Value>) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let mut line = json!({
            "seq": seq,
            "id": id,
            "changes": [{"rev": rev}],
        });
        if deleted {
            line["deleted"] = json!(true);
        }
        if let Some(doc) = doc {
            line["doc"] = doc.clone();
        }
        let line = format!("{line}\n");
        self.changes
            .lock()
            .unwrap()
            .push(ChangeRecord { seq, line: line.clone() });
        self.live
            .lock()
            .unwrap()
            .retain(|tx| tx.try_send(line.clone()).is_ok());
    }

    fn put_doc(&self, db: &str, id: &str, mut doc: Value) -> Result<(String, Value), StatusCode> {
        let mut dbs = self.dbs.lock().unwrap();
        let db = dbs.get_mut(db).ok_or(StatusCode::NOT_FOUND)?;
        let stored_rev = db
            .docs
            .get(id)
            .and_then(|d| d.get("_rev"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let supplied_rev = doc
            .get("_rev")
            .and_then(Value::as_str)
            .map(str::to_string);
        if stored_rev != supplied_rev {
            return Err(StatusCode::CONFLICT);
        }
        let rev = Self::next_rev(stored_rev.as_deref());
        doc["_id"] = json!(id);
        doc["_rev"] = json!(rev);
        db.docs.insert(id.to_string(), doc.clone());
        Ok((rev, doc))
    }
}

type Shared = Arc<MockCouch>;

/// Spawn the mock server; returns its state handle and base URL.
pub async fn spawn() -> (Shared, String) {
    let state: Shared = Arc::new(MockCouch::default());

    let app = Router::new()
        .route("/_active_tasks", get(active_tasks))
        .route("/_scheduler/docs", get(scheduler_docs))
        .route("/_scheduler/jobs", get(scheduler_jobs))
        .route("/{db}", any(db_root))
        .route("/{db}/_security", put(put_security))
        .route("/{db}/_design_docs", get(design_docs))
        .route("/{db}/_all_docs", any(all_docs))
        .route("/{db}/_bulk_docs", post(bulk_docs))
        .route("/{db}/_find", post(find))
        .route("/{db}/_changes", get(changes))
        .route("/{db}/_purge", post(purge))
        .route("/{db}/_design/{name}/_view/{view}", any(view))
        .route("/{db}/_design/{name}", any(design_doc))
        .route("/{db}/{id}", any(doc))
        .route("/{db}/{id}/{att}", any(attachment))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (state, format!("http://{addr}"))
}

fn requires_auth(db: &str, headers: &HeaderMap) -> bool {
    db == "authdb" && !headers.contains_key(axum::http::header::AUTHORIZATION)
}

async fn db_root(
    State(state): State<Shared>,
    Path(db): Path<String>,
    headers: HeaderMap,
    method: axum::http::Method,
    body: Bytes,
) -> Response {
    if requires_auth(&db, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match method.as_str() {
        "GET" => {
            let dbs = state.dbs.lock().unwrap();
            if dbs.contains_key(&db) {
                Json(json!({"db_name": db, "doc_count": dbs[&db].docs.len()})).into_response()
            } else {
                StatusCode::NOT_FOUND.into_response()
            }
        }
        "PUT" => {
            state.dbs.lock().unwrap().entry(db).or_default();
            (StatusCode::CREATED, Json(json!({"ok": true}))).into_response()
        }
        "DELETE" => {
            if state.dbs.lock().unwrap().remove(&db).is_some() {
                Json(json!({"ok": true})).into_response()
            } else {
                StatusCode::NOT_FOUND.into_response()
            }
        }
        // POST /<db>: create a document keyed by the body's _id
        // (replicator command submissions land here).
        "POST" => {
            let Ok(doc) = serde_json::from_slice::<Value>(&body) else {
                return StatusCode::BAD_REQUEST.into_response();
            };
            let id = doc
                .get("_id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("auto-{}", state.seq.load(Ordering::SeqCst)));
            match state.put_doc(&db, &id, doc) {
                Ok((rev, _)) => (
                    StatusCode::CREATED,
                    Json(json!({"ok": true, "id": id, "rev": rev})),
                )
                    .into_response(),
                Err(status) => status.into_response(),
            }
        }
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

async fn put_security(Path(_db): Path<String>, Json(_body): Json<Value>) -> Response {
    Json(json!({"ok": true})).into_response()
}

async fn design_docs(State(state): State<Shared>, Path(db): Path<String>) -> Response {
    let dbs = state.dbs.lock().unwrap();
    let Some(db) = dbs.get(&db) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let rows: Vec<Value> = db
        .docs
        .keys()
        .filter(|id| id.starts_with("_design/"))
        .map(|id| json!({"id": id, "key": id}))
        .collect();
    Json(json!({"total_rows": rows.len(), "rows": rows})).into_response()
}

async fn all_docs(
    State(state): State<Shared>,
    Path(db): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let keys: Vec<String> = if !body.is_empty() {
        serde_json::from_slice::<Value>(&body)
            .ok()
            .and_then(|v| v.get("keys").cloned())
            .and_then(|k| serde_json::from_value(k).ok())
            .unwrap_or_default()
    } else if let Some(key) = params.get("key") {
        vec![serde_json::from_str::<String>(key).unwrap_or_else(|_| key.clone())]
    } else {
        Vec::new()
    };
    let include_docs = params.get("include_docs").map(String::as_str) == Some("true");

    let dbs = state.dbs.lock().unwrap();
    let Some(db) = dbs.get(&db) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let source: Vec<String> = if keys.is_empty() {
        db.docs.keys().cloned().collect()
    } else {
        keys
    };
    let rows: Vec<Value> = source
        .iter()
        .map(|id| match db.docs.get(id) {
            Some(doc) => {
                let rev = doc.get("_rev").cloned().unwrap_or(Value::Null);
                let mut row = json!({"id": id, "key": id, "value": {"rev": rev}});
                if include_docs {
                    row["doc"] = doc.clone();
                }
                row
            }
            None => json!({"key": id, "error": "not_found"}),
        })
        .collect();

    let mut response = json!({"total_rows": rows.len(), "rows": rows});
    if params.get("update_seq").map(String::as_str) == Some("true") {
        response["update_seq"] = json!(state.seq.load(Ordering::SeqCst));
    }
    Json(response).into_response()
}

async fn bulk_docs(
    State(state): State<Shared>,
    Path(db): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let docs: Vec<Value> = body
        .get("docs")
        .and_then(|d| serde_json::from_value(d.clone()).ok())
        .unwrap_or_default();
    let mut results = Vec::new();
    for doc in docs {
        let id = doc
            .get("_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("gen-{}", results.len()));
        match state.put_doc(&db, &id, doc) {
            Ok((rev, stored)) => {
                let deleted = stored.get("_deleted").and_then(Value::as_bool) == Some(true);
                state.record_change(&id, &rev, deleted, Some(&stored));
                results.push(json!({"id": id, "rev": rev, "ok": true}));
            }
            Err(StatusCode::CONFLICT) => {
                results.push(json!({
                    "id": id,
                    "error": "conflict",
                    "reason": "Document update conflict."
                }));
            }
            Err(status) => return status.into_response(),
        }
    }
    (StatusCode::CREATED, Json(json!(results))).into_response()
}

async fn find(
    State(state): State<Shared>,
    Path(db): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let dbs = state.dbs.lock().unwrap();
    let Some(db) = dbs.get(&db) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    // Supports the `$and`-of-`$eq` shape the tests issue.
    let conditions: Vec<(String, Value)> = body
        .get("selector")
        .and_then(|s| s.get("$and"))
        .and_then(Value::as_array)
        .map(|predicates| {
            predicates
                .iter()
                .filter_map(|p| {
                    let (field, op) = p.as_object()?.iter().next()?;
                    Some((field.clone(), op.get("$eq")?.clone()))
                })
                .collect()
        })
        .unwrap_or_default();

    let docs: Vec<Value> = db
        .docs
        .values()
        .filter(|doc| {
            !doc.get("_id")
                .and_then(Value::as_str)
                .is_some_and(|id| id.starts_with("_design/"))
        })
        .filter(|doc| {
            conditions
                .iter()
                .all(|(field, expected)| doc.get(field) == Some(expected))
        })
        .cloned()
        .collect();

    Json(json!({"docs": docs, "bookmark": "mock-bookmark"})).into_response()
}

async fn changes(
    State(state): State<Shared>,
    Path(_db): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let since = params.get("since").cloned().unwrap_or_default();
    state.since_log.lock().unwrap().push(since.clone());
    let since: u64 = match since.as_str() {
        "now" | "" => state.seq.load(Ordering::SeqCst),
        text => text.parse().unwrap_or(0),
    };

    let backlog: Vec<String> = state
        .changes
        .lock()
        .unwrap()
        .iter()
        .filter(|record| record.seq > since)
        .map(|record| record.line.clone())
        .collect();

    let (tx, rx) = async_channel::unbounded();
    state.live.lock().unwrap().push(tx);

    let lines = futures::stream::iter(backlog).chain(rx);
    let drop_after = state.drop_changes_after.swap(0, Ordering::SeqCst);
    let lines: futures::stream::BoxStream<'static, String> = if drop_after > 0 {
        lines.take(drop_after).boxed()
    } else {
        lines.boxed()
    };

    let body = Body::from_stream(lines.map(Ok::<_, Infallible>));
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(body)
        .unwrap()
}

async fn purge(
    State(state): State<Shared>,
    Path(db): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let mut dbs = state.dbs.lock().unwrap();
    let Some(db) = dbs.get_mut(&db) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let mut purged = serde_json::Map::new();
    if let Some(object) = body.as_object() {
        for (id, revs) in object {
            if db.docs.remove(id).is_some() {
                purged.insert(id.clone(), revs.clone());
            }
        }
    }
    Json(json!({"purged": purged})).into_response()
}

async fn view(
    State(state): State<Shared>,
    Path((db, _design, _view)): Path<(String, String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let dbs = state.dbs.lock().unwrap();
    let Some(db) = dbs.get(&db) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let include_docs = params.get("include_docs").map(String::as_str) == Some("true");
    let limit: usize = params
        .get("limit")
        .and_then(|l| l.parse().ok())
        .unwrap_or(usize::MAX);

    let mut ids: Vec<&String> = db
        .docs
        .keys()
        .filter(|id| !id.starts_with("_design/"))
        .collect();
    ids.sort();
    let total = ids.len();
    let rows: Vec<Value> = ids
        .into_iter()
        .take(limit)
        .map(|id| {
            let mut row = json!({"id": id, "key": id, "value": Value::Null});
            if include_docs {
                row["doc"] = db.docs[id].clone();
            }
            row
        })
        .collect();
    Json(json!({"total_rows": total, "offset": 0, "rows": rows})).into_response()
}

async fn design_doc(
    State(state): State<Shared>,
    Path((db, name)): Path<(String, String)>,
    method: axum::http::Method,
    body: Bytes,
) -> Response {
    let id = format!("_design/{name}");
    match method.as_str() {
        "GET" => {
            let dbs = state.dbs.lock().unwrap();
            match dbs.get(&db).and_then(|d| d.docs.get(&id)) {
                Some(doc) => Json(doc.clone()).into_response(),
                None => StatusCode::NOT_FOUND.into_response(),
            }
        }
        "PUT" => {
            let Ok(doc) = serde_json::from_slice::<Value>(&body) else {
                return StatusCode::BAD_REQUEST.into_response();
            };
            state.design_puts.fetch_add(1, Ordering::SeqCst);
            match state.put_doc(&db, &id, doc) {
                Ok((rev, _)) => (
                    StatusCode::CREATED,
                    Json(json!({"ok": true, "id": id, "rev": rev})),
                )
                    .into_response(),
                Err(status) => status.into_response(),
            }
        }
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

async fn doc(
    State(state): State<Shared>,
    Path((db, id)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    method: axum::http::Method,
    body: Bytes,
) -> Response {
    if requires_auth(&db, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match method.as_str() {
        "GET" => {
            let dbs = state.dbs.lock().unwrap();
            let Some(doc) = dbs.get(&db).and_then(|d| d.docs.get(&id)) else {
                return StatusCode::NOT_FOUND.into_response();
            };
            let mut doc = doc.clone();
            if params.get("revs_info").map(String::as_str) == Some("true") {
                let rev = doc.get("_rev").cloned().unwrap_or(Value::Null);
                doc["_revs_info"] = json!([{"rev": rev, "status": "available"}]);
            }
            Json(doc).into_response()
        }
        "PUT" => {
            let Ok(doc) = serde_json::from_slice::<Value>(&body) else {
                return StatusCode::BAD_REQUEST.into_response();
            };
            match state.put_doc(&db, &id, doc) {
                Ok((rev, stored)) => {
                    state.record_change(&id, &rev, false, Some(&stored));
                    (
                        StatusCode::CREATED,
                        Json(json!({"ok": true, "id": id, "rev": rev})),
                    )
                        .into_response()
                }
                Err(status) => status.into_response(),
            }
        }
        "DELETE" => {
            let supplied = params.get("rev").cloned().unwrap_or_default();
            let mut dbs = state.dbs.lock().unwrap();
            let Some(db_state) = dbs.get_mut(&db) else {
                return StatusCode::NOT_FOUND.into_response();
            };
            let Some(stored) = db_state.docs.get(&id) else {
                return StatusCode::NOT_FOUND.into_response();
            };
            if stored.get("_rev").and_then(Value::as_str) != Some(supplied.as_str()) {
                return StatusCode::CONFLICT.into_response();
            }
            db_state.docs.remove(&id);
            drop(dbs);
            let rev = MockCouch::next_rev(Some(&supplied));
            state.record_change(&id, &rev, true, None);
            Json(json!({"ok": true, "id": id, "rev": rev})).into_response()
        }
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

async fn attachment(
    State(state): State<Shared>,
    Path((db, id, att)): Path<(String, String, String)>,
    method: axum::http::Method,
    body: Bytes,
) -> Response {
    let key = format!("{id}/__att__/{att}");
    match method.as_str() {
        "GET" => {
            let dbs = state.dbs.lock().unwrap();
            match dbs.get(&db).and_then(|d| d.docs.get(&key)) {
                Some(Value::String(data)) => data.clone().into_response(),
                _ => StatusCode::NOT_FOUND.into_response(),
            }
        }
        "PUT" => {
            let mut dbs = state.dbs.lock().unwrap();
            let Some(db_state) = dbs.get_mut(&db) else {
                return StatusCode::NOT_FOUND.into_response();
            };
            db_state.docs.insert(
                key,
                Value::String(String::from_utf8_lossy(&body).into_owned()),
            );
            let rev = MockCouch::next_rev(None);
            (
                StatusCode::CREATED,
                Json(json!({"ok": true, "id": id, "rev": rev})),
            )
                .into_response()
        }
        "DELETE" => {
            let mut dbs = state.dbs.lock().unwrap();
            let removed = dbs
                .get_mut(&db)
                .map(|d| d.docs.remove(&key).is_some())
                .unwrap_or(false);
            if removed {
                Json(json!({"ok": true, "id": id, "rev": MockCouch::next_rev(None)}))
                    .into_response()
            } else {
                StatusCode::NOT_FOUND.into_response()
            }
        }
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

async fn active_tasks() -> Response {
    Json(json!([
        {"type": "indexer", "pid": "<0.99.0>", "database": "orders",
         "design_document": "_design/Order", "progress": 55,
         "started_on": 1, "updated_on": 2},
        {"type": "mystery_task", "pid": "<0.1.0>"}
    ]))
    .into_response()
}

async fn scheduler_docs(State(state): State<Shared>) -> Response {
    let dbs = state.dbs.lock().unwrap();
    let docs: Vec<Value> = dbs
        .get("_replicator")
        .map(|db| {
            db.docs
                .keys()
                .map(|id| {
                    json!({
                        "database": "_replicator",
                        "doc_id": id,
                        "id": null,
                        "state": "running",
                        "error_count": 0,
                        "info": null
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    Json(json!({"total_rows": docs.len(), "offset": 0, "docs": docs})).into_response()
}

async fn scheduler_jobs() -> Response {
    Json(json!({"total_rows": 0, "offset": 0, "jobs": []})).into_response()
}
