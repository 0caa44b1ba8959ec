#![cfg(unix)]

#[path = "support/fake_worker.rs"]
mod fake_worker;

use std::time::Duration;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Method, Request, StatusCode, header},
    response::Response,
};
use fake_worker::{FakeWorker, eventually};
use rasterd::{
    application::render::RenderService,
    config::RenderSettings,
    infra::http::{HttpState, build_router},
    pool::WorkerPool,
};
use serde_json::Value;
use tower::ServiceExt;

const BOUNDARY: &str = "rasterd-test-boundary";

struct Harness {
    fake: FakeWorker,
    pool: WorkerPool,
    router: Router,
}

impl Harness {
    fn new(fake: FakeWorker, min_idle: usize, max_document_bytes: usize) -> Self {
        let pool = WorkerPool::new(fake.pool_config(min_idle, 1, 1)).expect("pool");
        let settings = RenderSettings {
            acquire_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(5),
            max_dpi: 600,
            jpeg_quality: 85,
            max_document_bytes,
        };
        let service = RenderService::new(pool.clone(), &settings);
        let router = build_router(HttpState::new(service, max_document_bytes));
        Self { fake, pool, router }
    }

    fn started(fake: FakeWorker) -> Self {
        let harness = Self::new(fake, 0, 1024 * 1024);
        harness.pool.initialize().expect("initialize");
        harness
    }

    async fn send(&self, request: Request<Body>) -> Response {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router response")
    }

    async fn render(&self, fields: &[(&str, &[u8])]) -> (StatusCode, Option<String>, Vec<u8>) {
        let response = self.send(render_request(fields)).await;
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body")
            .to_vec();
        (status, content_type, body)
    }
}

fn render_request(fields: &[(&str, &[u8])]) -> Request<Body> {
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        if *name == "file" {
            body.extend_from_slice(
                b"Content-Disposition: form-data; name=\"file\"; filename=\"doc.pdf\"\r\n\
                  Content-Type: application/pdf\r\n\r\n",
            );
        } else {
            body.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
            );
        }
        body.extend_from_slice(value);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method(Method::POST)
        .uri("/render")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .expect("request")
}

fn text(body: &[u8]) -> String {
    String::from_utf8_lossy(body).into_owned()
}

#[tokio::test]
async fn livez_always_answers() {
    let harness = Harness::new(FakeWorker::new(), 1, 1024);
    let response = harness
        .send(Request::get("/livez").body(Body::empty()).expect("request"))
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value =
        serde_json::from_slice(&to_bytes(response.into_body(), usize::MAX).await.expect("body"))
            .expect("json");
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn readyz_follows_pool_warmup() {
    let harness = Harness::new(FakeWorker::new(), 1, 1024);

    let response = harness
        .send(Request::get("/readyz").body(Body::empty()).expect("request"))
        .await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value =
        serde_json::from_slice(&to_bytes(response.into_body(), usize::MAX).await.expect("body"))
            .expect("json");
    assert_eq!(body["ready"], false);

    harness.pool.initialize().expect("initialize");
    assert!(eventually(Duration::from_secs(5), || harness.pool.readiness().ready).await);

    let response = harness
        .send(Request::get("/readyz").body(Body::empty()).expect("request"))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value =
        serde_json::from_slice(&to_bytes(response.into_body(), usize::MAX).await.expect("body"))
            .expect("json");
    assert_eq!(body["ready"], true);
    assert_eq!(body["idle"], 1);

    harness.pool.shutdown(Duration::from_secs(1)).await;
    let response = harness
        .send(Request::get("/readyz").body(Body::empty()).expect("request"))
        .await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn renders_a_page_as_jpeg() {
    let harness = Harness::started(FakeWorker::new());

    let (status, content_type, body) = harness
        .render(&[("file", b"%PDF-1.7 doc"), ("page", b"1"), ("dpi", b"150")])
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type.as_deref(), Some("image/jpeg"));
    assert_eq!(&body[..3], &[0xFF, 0xD8, 0xFF]);

    harness.pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn non_positive_pages_select_the_first_page() {
    let harness = Harness::started(FakeWorker::new());

    for page in [b"0".as_slice(), b"-4".as_slice()] {
        let (status, _, body) = harness
            .render(&[("dpi", b"72"), ("page", page), ("file", b"%PDF-1.7 doc")])
            .await;
        assert_eq!(status, StatusCode::OK, "{}", text(&body));
    }
    assert_eq!(harness.fake.spawn_count(), 1);

    harness.pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn pages_past_the_end_are_client_errors() {
    let harness = Harness::started(FakeWorker::new().with_env("FAKE_PAGES", "3"));

    let (status, _, body) = harness
        .render(&[("file", b"%PDF-1.7 doc"), ("page", b"3"), ("dpi", b"72")])
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body_after) = harness
        .render(&[("file", b"%PDF-1.7 doc"), ("page", b"4"), ("dpi", b"72")])
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        text(&body_after),
        "pdfium err: page could not be rendered: page 4 does not exist, document has 3 page(s)"
    );
    assert!(!body.is_empty());

    harness.pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn unreadable_documents_are_client_errors() {
    let harness = Harness::started(FakeWorker::new());

    let (status, _, body) = harness
        .render(&[("file", b"corrupt"), ("page", b"1"), ("dpi", b"72")])
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        text(&body),
        "pdfium err: document could not be opened: invalid xref table"
    );

    // The worker that saw the bad document is not reused.
    let (status, _, _) = harness
        .render(&[("file", b"%PDF-1.7 doc"), ("page", b"1"), ("dpi", b"72")])
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(harness.fake.spawn_count(), 2);

    harness.pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn invalid_form_input_is_rejected_before_rendering() {
    let harness = Harness::started(FakeWorker::new());

    let cases: [(&[(&str, &[u8])], &str); 4] = [
        (
            &[("page", b"1"), ("dpi", b"72")],
            "err: missing form field `file`",
        ),
        (
            &[("file", b"%PDF"), ("dpi", b"72")],
            "err: missing form field `page`",
        ),
        (
            &[("file", b"%PDF"), ("page", b"one"), ("dpi", b"72")],
            "err: field `page` must be an integer, got \"one\"",
        ),
        (
            &[("file", b"%PDF"), ("page", b"1"), ("dpi", b"0")],
            "err: dpi must be a positive integer, got 0",
        ),
    ];

    for (fields, expected) in cases {
        let (status, _, body) = harness.render(fields).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(text(&body), expected);
    }
    assert_eq!(harness.fake.spawn_count(), 0);

    harness.pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn non_multipart_bodies_are_rejected() {
    let harness = Harness::started(FakeWorker::new());

    let response = harness
        .send(
            Request::builder()
                .method(Method::POST)
                .uri("/render")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{}"))
                .expect("request"),
        )
        .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert!(text(&body).starts_with("err: "));

    harness.pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn oversized_documents_are_refused() {
    let harness = Harness::new(FakeWorker::new(), 0, 16);
    harness.pool.initialize().expect("initialize");

    let (status, _, body) = harness
        .render(&[("file", &[b'%'; 64]), ("page", b"1"), ("dpi", b"72")])
        .await;

    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(text(&body), "err: document exceeds the 16 byte limit");
    assert_eq!(harness.fake.spawn_count(), 0);

    harness.pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn a_crashing_document_does_not_take_the_service_down() {
    let harness = Harness::started(FakeWorker::new());

    let (status, _, body) = harness
        .render(&[("file", b"crash!"), ("page", b"1"), ("dpi", b"72")])
        .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(text(&body), "pdfium err: rendering worker crashed");

    let (status, _, _) = harness
        .render(&[("file", b"%PDF-1.7 doc"), ("page", b"1"), ("dpi", b"72")])
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(harness.fake.spawn_count(), 2);

    harness.pool.shutdown(Duration::from_secs(1)).await;
}
