use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use ppsc::application::admin::AdminCacheService;
use ppsc::application::repos::{AntiForgery, PreloadError, PreloadFetcher};
use ppsc::cache::{AuditLog, CacheStore, GateEvaluator};
use ppsc::domain::{resources::GatedResource, types::ResourceId};
use ppsc::infra::http::{AdminState, build_admin_router};
use ppsc::infra::manifest::{ResourceManifest, secret_digest};
use ppsc::infra::tokens::ActionTokens;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

const OPERATOR_TOKEN: &str = "operator-token";

#[derive(Default)]
struct CountingFetcher {
    calls: AtomicUsize,
}

#[async_trait]
impl PreloadFetcher for CountingFetcher {
    async fn fetch(&self, resource: &GatedResource) -> Result<(), PreloadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if resource.id.get() == 2 {
            return Err(PreloadError {
                path: resource.path.clone(),
                message: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

struct Admin {
    _dir: TempDir,
    store: Arc<CacheStore>,
    fetcher: Arc<CountingFetcher>,
    tokens: Arc<ActionTokens>,
    router: Router,
}

fn id(value: u64) -> ResourceId {
    ResourceId::new(value).unwrap()
}

fn admin() -> Admin {
    let dir = TempDir::new().expect("tempdir");
    let text = format!(
        r#"
        [[resources]]
        id = 1
        path = "/members/one"
        kind = "post"
        status = "publish"
        secret_digest = "{digest}"

        [[resources]]
        id = 2
        path = "/members/two"
        kind = "page"
        status = "private"
        secret_digest = "{digest}"

        [[resources]]
        id = 3
        path = "/open"
        "#,
        digest = secret_digest("pw")
    );
    let manifest = Arc::new(
        ResourceManifest::parse(&text)
            .unwrap()
            .with_operator_digest(Some(secret_digest(OPERATOR_TOKEN))),
    );

    let store = Arc::new(CacheStore::new(dir.path().join("cache")));
    store.ensure_directory().expect("cache directory");
    let audit = Arc::new(AuditLog::new(dir.path().join("cache").join("ppsc-debug.log")));
    let fetcher = Arc::new(CountingFetcher::default());
    let tokens = Arc::new(ActionTokens::new(Some("form-secret".to_string())));

    let service = AdminCacheService::new(
        Arc::clone(&store),
        audit,
        manifest.clone(),
        fetcher.clone(),
        tokens.clone(),
    );
    let gate: Arc<dyn GateEvaluator> = manifest;
    let router = build_admin_router(AdminState {
        cache: Arc::new(service),
        gate,
    });

    Admin {
        _dir: dir,
        store,
        fetcher,
        tokens,
        router,
    }
}

impl Admin {
    fn token(&self) -> String {
        self.tokens.issue("ppsc_cache_action")
    }

    async fn call(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn post_action(&self, form: &str, operator: bool) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/cache/actions")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
        if operator {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {OPERATOR_TOKEN}"));
        }
        self.call(builder.body(Body::from(form.to_string())).unwrap())
            .await
    }
}

fn operator_get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {OPERATOR_TOKEN}"))
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn coverage_lists_gated_resources_with_entry_state() {
    let admin = admin();
    admin.store.put(id(1), b"<p>one</p>").unwrap();

    let (status, page) = admin.call(operator_get("/cache")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["token"], Value::String(admin.token()));
    let rows = page["resources"].as_array().expect("rows");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["id"], 1);
    assert_eq!(rows[0]["cached"], true);
    assert_eq!(rows[0]["size_bytes"], 10);
    assert!(rows[0]["modified"].is_string());
    assert_eq!(rows[1]["id"], 2);
    assert_eq!(rows[1]["cached"], false);
    assert!(rows[1]["path"].is_null());
}

#[tokio::test]
async fn anonymous_requests_are_refused() {
    let admin = admin();
    admin.store.put(id(1), b"<p>one</p>").unwrap();

    let request = Request::builder().uri("/cache").body(Body::empty()).unwrap();
    let (status, _) = admin.call(request).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let form = format!("action=clear_all&_token={}", admin.token());
    let (status, _) = admin.post_action(&form, false).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(admin.store.get(id(1)).unwrap().is_some());
}

#[tokio::test]
async fn actions_require_a_valid_token() {
    let admin = admin();
    admin.store.put(id(1), b"<p>one</p>").unwrap();

    let (status, _) = admin
        .post_action("action=clear_all&_token=deadbeef", true)
        .await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(admin.store.get(id(1)).unwrap().is_some());
}

#[tokio::test]
async fn clear_one_and_clear_all_remove_entries() {
    let admin = admin();
    admin.store.put(id(1), b"<p>one</p>").unwrap();
    admin.store.put(id(2), b"<p>two</p>").unwrap();

    let form = format!("action=clear_one&resource_id=1&_token={}", admin.token());
    let (status, result) = admin.post_action(&form, true).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["action"], "clear_one");
    assert_eq!(result["outcome"], "removed");
    assert!(admin.store.get(id(1)).unwrap().is_none());

    let (_, result) = admin.post_action(&form, true).await;
    assert_eq!(result["outcome"], "not_found");

    let form = format!("action=clear_all&_token={}", admin.token());
    let (status, result) = admin.post_action(&form, true).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["removed"], 1);
    assert_eq!(result["failed"], 0);
    assert!(admin.store.list_all().unwrap().is_empty());

    let (status, log) = admin.call(operator_get("/cache/log")).await;
    assert_eq!(status, StatusCode::OK);
    let lines = log["lines"].as_array().expect("lines");
    assert!(lines[0].as_str().unwrap().contains("cleared all cache files"));
}

#[tokio::test]
async fn invalid_actions_are_rejected() {
    let admin = admin();

    let form = format!("action=clear_one&resource_id=0&_token={}", admin.token());
    let (status, _) = admin.post_action(&form, true).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let form = format!("action=rebuild&_token={}", admin.token());
    let (status, _) = admin.post_action(&form, true).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn preload_counts_failures_without_aborting() {
    let admin = admin();

    let form = format!("action=preload_all&_token={}", admin.token());
    let (status, result) = admin.post_action(&form, true).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["attempted"], 2);
    assert_eq!(result["failed"], 1);
    assert_eq!(admin.fetcher.calls.load(Ordering::SeqCst), 2);
}
