use std::{collections::HashMap, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::get,
};
use parking_lot::Mutex;
use schema::{FieldValue, Record};
use serde_json::Value;
use store::{
    BATCH_COLUMN, DatasetKey, DatasetStore, FallbackBackend, HostedBackend, HostedConfig,
    PersistenceBackend, StoreError, StoreOptions, StoreResult, XlsxCodec,
};

const API_KEY: &str = "anon-key";

#[derive(Default)]
struct MockTables {
    rows: HashMap<String, Vec<Value>>,
    posts: usize,
    deletes: usize,
    /// 1-based index of the next POST to reject.
    fail_post: Option<usize>,
}

type Tables = Arc<Mutex<MockTables>>;

fn authorized(headers: &HeaderMap) -> bool {
    let apikey = headers.get("apikey").and_then(|value| value.to_str().ok());
    let bearer = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok());
    apikey == Some(API_KEY) && bearer == Some("Bearer anon-key")
}

fn batch_of(row: &Value) -> Option<&str> {
    row.get(BATCH_COLUMN).and_then(Value::as_str)
}

async fn list_rows(
    State(tables): State<Tables>,
    Path(table): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Vec<Value>>, StatusCode> {
    if !authorized(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(Json(tables.lock().rows.get(&table).cloned().unwrap_or_default()))
}

async fn insert_rows(
    State(tables): State<Tables>,
    Path(table): Path<String>,
    headers: HeaderMap,
    Json(rows): Json<Vec<Value>>,
) -> StatusCode {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED;
    }
    let mut tables = tables.lock();
    tables.posts += 1;
    if tables.fail_post == Some(tables.posts) {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    tables.rows.entry(table).or_default().extend(rows);
    StatusCode::CREATED
}

/// Supports the two filters the backend sends: `lote=eq.X` and
/// `or=(lote.is.null,lote.neq.X)`.
async fn delete_rows(
    State(tables): State<Tables>,
    Path(table): Path<String>,
    Query(filter): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> StatusCode {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED;
    }
    let mut tables = tables.lock();
    tables.deletes += 1;
    let rows = tables.rows.entry(table).or_default();
    if let Some(batch) = filter.get(BATCH_COLUMN).and_then(|value| value.strip_prefix("eq.")) {
        rows.retain(|row| batch_of(row) != Some(batch));
        return StatusCode::NO_CONTENT;
    }
    let keep = filter.get("or").and_then(|value| {
        value
            .strip_prefix(&format!("({BATCH_COLUMN}.is.null,{BATCH_COLUMN}.neq."))
            .and_then(|rest| rest.strip_suffix(')'))
            .map(str::to_string)
    });
    match keep {
        Some(batch) => {
            rows.retain(|row| batch_of(row) == Some(batch.as_str()));
            StatusCode::NO_CONTENT
        }
        None => StatusCode::BAD_REQUEST,
    }
}

async fn spawn_table_server() -> (String, Tables) {
    let tables = Tables::default();
    let app = Router::new()
        .route(
            "/rest/v1/:table",
            get(list_rows).post(insert_rows).delete(delete_rows),
        )
        .with_state(tables.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("mock server should bind");
    let addr = listener.local_addr().expect("mock server has an address");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("mock server runs");
    });
    (format!("http://{addr}/"), tables)
}

fn hosted(base_url: String, api_key: &str) -> HostedBackend {
    HostedBackend::new(
        HostedConfig {
            base_url,
            api_key: api_key.to_string(),
            timeout: Duration::from_secs(5),
        },
        Duration::from_secs(1),
    )
    .expect("client should build")
}

#[tokio::test]
async fn hosted_backend_round_trips_rows_through_the_table_api() {
    let (url, tables) = spawn_table_server().await;
    let backend = hosted(url, API_KEY);

    backend
        .append(
            DatasetKey::Roster,
            Record::new().with("nome", "ana").with("senha", "123"),
        )
        .await
        .expect("append should succeed");
    let records = backend
        .mutate(
            DatasetKey::Roster,
            Arc::new(|records: &mut Vec<Record>| -> StoreResult<()> {
                records.push(Record::new().with("nome", "bia").with("senha", FieldValue::Empty));
                Ok(())
            }),
        )
        .await
        .expect("mutation should succeed");
    assert_eq!(records.len(), 2);

    let stored = tables.lock().rows.get("projetistas").cloned().unwrap_or_default();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[1]["nome"], "bia");
    assert!(stored[1]["senha"].is_null());

    let fetched = backend
        .read(DatasetKey::Roster)
        .await
        .expect("read should succeed");
    assert_eq!(fetched, records);
    assert_eq!(tables.lock().deletes, 0);
}

#[tokio::test]
async fn hosted_backend_replace_inserts_in_chunks_then_drops_the_old_batch() {
    let (url, tables) = spawn_table_server().await;
    let backend = hosted(url, API_KEY);
    let rows: Vec<Record> = (0..1_234)
        .map(|index| {
            Record::new()
                .with("cid_rede", format!("rede-{index}"))
                .with("latitude", -22.0)
        })
        .collect();

    backend
        .replace(DatasetKey::CtoBase, rows.clone())
        .await
        .expect("first replace should succeed");
    backend
        .replace(DatasetKey::CtoBase, rows[..10].to_vec())
        .await
        .expect("second replace should succeed");

    assert_eq!(
        tables.lock().rows.get("base_cto").map(Vec::len),
        Some(10)
    );
    let fetched = backend.read(DatasetKey::CtoBase).await.expect("read should succeed");
    assert_eq!(fetched, rows[..10].to_vec());
}

fn ticket(sequence: u32) -> Record {
    Record::new()
        .with("VI ALA", format!("VI ALA-{sequence:07}"))
        .with("operador", "Ana")
}

#[tokio::test]
async fn failed_insert_keeps_the_previous_rows() {
    let (url, tables) = spawn_table_server().await;
    let backend = hosted(url, API_KEY);
    let previous: Vec<Record> = (1..=600).map(ticket).collect();
    backend
        .replace(DatasetKey::Ledger, previous.clone())
        .await
        .expect("seed replace should succeed");

    {
        let mut tables = tables.lock();
        tables.fail_post = Some(tables.posts + 2);
    }
    let err = backend
        .mutate(
            DatasetKey::Ledger,
            Arc::new(|records: &mut Vec<Record>| -> StoreResult<()> {
                records.reverse();
                records.push(ticket(601));
                Ok(())
            }),
        )
        .await
        .expect_err("second chunk is rejected");
    assert!(err.is_infrastructure());

    assert_eq!(tables.lock().rows.get("vi_ala").map(Vec::len), Some(600));
    let fetched = backend.read(DatasetKey::Ledger).await.expect("read should succeed");
    assert_eq!(fetched, previous);
}

#[tokio::test]
async fn appending_mutation_posts_only_the_new_row() {
    let (url, tables) = spawn_table_server().await;
    let backend = hosted(url, API_KEY);
    backend
        .replace(DatasetKey::Ledger, (1..=3).map(ticket).collect())
        .await
        .expect("seed replace should succeed");
    let (posts, deletes) = {
        let tables = tables.lock();
        (tables.posts, tables.deletes)
    };

    let records = backend
        .mutate(
            DatasetKey::Ledger,
            Arc::new(|records: &mut Vec<Record>| -> StoreResult<()> {
                records.push(ticket(4));
                Ok(())
            }),
        )
        .await
        .expect("append should succeed");
    assert_eq!(records.len(), 4);

    let tables_now = tables.lock();
    assert_eq!(tables_now.posts, posts + 1);
    assert_eq!(tables_now.deletes, deletes);
    let stored = tables_now.rows.get("vi_ala").cloned().unwrap_or_default();
    assert_eq!(stored.len(), 4);
    let batches: Vec<Option<&str>> = stored.iter().map(batch_of).collect();
    assert!(batches.iter().all(|batch| batch.is_some() && *batch == batches[0]));
}

#[tokio::test]
async fn hosted_backend_reports_rejected_credentials_as_backend_errors() {
    let (url, _tables) = spawn_table_server().await;
    let backend = hosted(url, "wrong-key");

    let err = backend
        .read(DatasetKey::Tags)
        .await
        .expect_err("bad key should be rejected");
    assert!(matches!(err, StoreError::Backend(ref message) if message.contains("401")));
    assert!(err.is_infrastructure());
}

#[tokio::test]
async fn unreachable_hosted_backend_falls_back_to_local_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    let local = Arc::new(DatasetStore::new(
        dir.path(),
        Arc::new(XlsxCodec),
        StoreOptions::default(),
    ));
    // Nothing listens on the discard port.
    let primary = hosted("http://127.0.0.1:9".to_string(), API_KEY);
    let backend = FallbackBackend::new(Arc::new(primary), local.clone());

    backend
        .append(DatasetKey::Tags, Record::new().with("tabulacao", "Viavel"))
        .await
        .expect("fallback should serve the append");
    let records = backend
        .read(DatasetKey::Tags)
        .await
        .expect("fallback should serve the read");
    assert_eq!(records.len(), 1);
    assert!(dir.path().join("tabulacoes.xlsx").exists());
}
