use std::sync::Arc;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, Response, StatusCode, header::CONTENT_TYPE},
};
use serde_json::{Value, json};
use store::CodecKind;
use tower::ServiceExt;
use viability::{ViabilityConfig, ViabilityService, transport};

fn app(dir: &std::path::Path) -> (Router, Arc<ViabilityService>) {
    let config = ViabilityConfig {
        data_dir: dir.to_path_buf(),
        codec: CodecKind::Delimited,
        ..ViabilityConfig::default()
    };
    let service = Arc::new(ViabilityService::from_config(&config).expect("service should build"));
    (transport::router(Arc::clone(&service)), service)
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).expect("request")
}

async fn read_json(response: Response<Body>) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

#[tokio::test]
async fn health_reports_ok() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (app, _) = app(dir.path());

    let response = app.oneshot(get("/health")).await.expect("health");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_json(response).await["status"], "ok");
}

#[tokio::test]
async fn login_heartbeat_and_logout_track_the_session() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (app, service) = app(dir.path());

    let created = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/projetistas",
            json!({ "nome": "Ana", "senha": "segredo" }),
        ))
        .await
        .expect("add designer");
    assert_eq!(created.status(), StatusCode::CREATED);

    let rejected = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/login",
            json!({ "nome": "ana", "senha": "errado" }),
        ))
        .await
        .expect("login");
    assert_eq!(rejected.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(read_json(rejected).await["code"], "unauthorized");

    let accepted = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/login",
            json!({ "nome": "ana", "senha": "segredo" }),
        ))
        .await
        .expect("login");
    assert_eq!(accepted.status(), StatusCode::OK);
    assert_eq!(read_json(accepted).await["nome"], "Ana");

    let online = read_json(app.clone().oneshot(get("/api/online")).await.expect("online")).await;
    assert_eq!(online.as_array().map(Vec::len), Some(1));
    assert_eq!(online[0]["nome"], "Ana");

    let beat = app
        .clone()
        .oneshot(json_request("POST", "/api/heartbeat", json!({ "nome": "Ana" })))
        .await
        .expect("heartbeat");
    assert_eq!(read_json(beat).await["active"], true);

    let out = app
        .clone()
        .oneshot(json_request("POST", "/api/logout", json!({ "nome": "Ana" })))
        .await
        .expect("logout");
    assert_eq!(read_json(out).await["logged_out"], true);
    assert!(service.sessions.logout_history().contains_key("Ana"));

    let online = read_json(app.oneshot(get("/api/online")).await.expect("online")).await;
    assert_eq!(online, json!([]));
}

#[tokio::test]
async fn roster_listing_hides_secrets_and_duplicates_conflict() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (app, _) = app(dir.path());

    for (name, expected) in [("Ana", StatusCode::CREATED), ("ANA", StatusCode::CONFLICT)] {
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/projetistas",
                json!({ "nome": name, "senha": "x" }),
            ))
            .await
            .expect("add designer");
        assert_eq!(response.status(), expected);
        if expected == StatusCode::CONFLICT {
            assert_eq!(read_json(response).await["code"], "conflict");
        }
    }

    let listed = read_json(
        app.clone()
            .oneshot(get("/api/projetistas"))
            .await
            .expect("list"),
    )
    .await;
    assert_eq!(listed, json!([{ "nome": "Ana" }]));

    let renamed = app
        .clone()
        .oneshot(json_request(
            "PUT",
            "/api/projetistas/ana",
            json!({ "novo_nome": "Ana Paula", "senha": "novo" }),
        ))
        .await
        .expect("update");
    assert_eq!(renamed.status(), StatusCode::OK);
    assert_eq!(read_json(renamed).await["nome"], "Ana Paula");

    let empty_update = app
        .clone()
        .oneshot(json_request("PUT", "/api/projetistas/Ana%20Paula", json!({})))
        .await
        .expect("update");
    assert_eq!(empty_update.status(), StatusCode::BAD_REQUEST);

    let removed = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/projetistas/Ana%20Paula")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("delete");
    assert_eq!(removed.status(), StatusCode::NO_CONTENT);

    let missing = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/projetistas/Ana%20Paula")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("delete");
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn tags_are_returned_sorted() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (app, _) = app(dir.path());

    for tag in ["Viavel", "atendido"] {
        let response = app
            .clone()
            .oneshot(json_request("POST", "/api/tabulacoes", json!({ "tabulacao": tag })))
            .await
            .expect("add tag");
        assert_eq!(response.status(), StatusCode::CREATED);
    }
    let listed = read_json(app.clone().oneshot(get("/api/tabulacoes")).await.expect("list")).await;
    assert_eq!(listed, json!(["atendido", "Viavel"]));

    let removed = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/tabulacoes/viavel")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("delete");
    assert_eq!(read_json(removed).await, json!(["atendido"]));
}

#[tokio::test]
async fn ticket_preview_then_commit_allocates_sequential_ids() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (app, _) = app(dir.path());

    let next = read_json(app.clone().oneshot(get("/api/vi-ala/next")).await.expect("next")).await;
    assert_eq!(next["ticket_id"], "VI ALA-0000001");

    for expected in ["VI ALA-0000001", "VI ALA-0000002"] {
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/vi-ala",
                json!({
                    "proposed_id": "VI ALA-0000001",
                    "sub_area": "ALA 3",
                    "operator": "Ana",
                    "city": "Niteroi",
                    "address": "Rua A, 10",
                    "latitude": -22.9,
                    "longitude": -43.1
                }),
            ))
            .await
            .expect("commit");
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(read_json(response).await["ticket_id"], expected);
    }

    let invalid = app
        .clone()
        .oneshot(json_request("POST", "/api/vi-ala", json!({ "operator": " " })))
        .await
        .expect("commit");
    assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
    assert_eq!(read_json(invalid).await["code"], "validation_error");

    let listed = read_json(
        app.oneshot(get("/api/vi-ala?projetista=ana"))
            .await
            .expect("list"),
    )
    .await;
    assert_eq!(listed.as_array().map(Vec::len), Some(2));
    assert_eq!(listed[0]["ticket_id"], "VI ALA-0000002");
}

#[tokio::test]
async fn upload_validates_before_replacing_and_feeds_the_proximity_query() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (app, _) = app(dir.path());

    let rejected = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/base/upload")
                .body(Body::from("estado\tpop\nRJ\tNIT01\n"))
                .expect("request"),
        )
        .await
        .expect("upload");
    assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);
    let message = read_json(rejected).await["message"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    assert!(message.contains("latitude, longitude"), "{message}");

    let accepted = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/base/upload")
                .body(Body::from(
                    "cto\tlatitude\tlongitude\nPerto\t-22.9001\t-43.1\nLonge\t-23.5\t-46.6\n",
                ))
                .expect("request"),
        )
        .await
        .expect("upload");
    assert_eq!(accepted.status(), StatusCode::OK);
    let report = read_json(accepted).await;
    assert_eq!(report["rows"], 2);
    assert_eq!(report["backend"], "file");

    let info = read_json(app.clone().oneshot(get("/api/base/info")).await.expect("info")).await;
    assert_eq!(info["rows"], 2);
    assert!(info["current"]["file_name"]
        .as_str()
        .is_some_and(|name| name.starts_with("base_atual_")));

    let nearby = read_json(
        app.clone()
            .oneshot(get("/api/ctos/nearby?lat=-22.9&lng=-43.1&raio=1000"))
            .await
            .expect("nearby"),
    )
    .await;
    assert_eq!(nearby.as_array().map(Vec::len), Some(1));
    assert_eq!(nearby[0]["cto_name"], "Perto");

    let out_of_range = app
        .oneshot(get("/api/ctos/nearby?lat=-95&lng=-43.1"))
        .await
        .expect("nearby");
    assert_eq!(out_of_range.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn conflicting_designer_update_changes_nothing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (app, _) = app(dir.path());

    for (name, secret) in [("Ana", "old"), ("Bia", "b")] {
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/projetistas",
                json!({ "nome": name, "senha": secret }),
            ))
            .await
            .expect("add designer");
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    let conflict = app
        .clone()
        .oneshot(json_request(
            "PUT",
            "/api/projetistas/Ana",
            json!({ "novo_nome": "Bia", "senha": "new" }),
        ))
        .await
        .expect("update");
    assert_eq!(conflict.status(), StatusCode::CONFLICT);

    for (secret, expected) in [("old", StatusCode::OK), ("new", StatusCode::UNAUTHORIZED)] {
        let login = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/login",
                json!({ "nome": "Ana", "senha": secret }),
            ))
            .await
            .expect("login");
        assert_eq!(login.status(), expected, "secret {secret}");
    }
}
