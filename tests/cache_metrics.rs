use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Request, header},
    response::Html,
    routing::get,
};
use metrics_util::debugging::{DebugValue, DebuggingRecorder};
use ppsc::cache::{CacheConfig, CacheCoordinator, GateEvaluator};
use ppsc::infra::http::build_router;
use ppsc::infra::manifest::{ResourceManifest, UNLOCK_COOKIE_PREFIX, secret_digest};
use tempfile::TempDir;
use tower::ServiceExt;

async fn render() -> Html<&'static str> {
    Html("<article>members only</article>")
}

#[tokio::test]
async fn gated_requests_emit_outcome_counters() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    let manifest = ResourceManifest::parse(&format!(
        "[[resources]]\nid = 9\npath = \"/vault\"\nsecret_digest = \"{}\"\n",
        secret_digest("pw")
    ))
    .expect("manifest");
    let gate: Arc<dyn GateEvaluator> = Arc::new(manifest);

    let dir = TempDir::new().expect("tempdir");
    let coordinator = Arc::new(CacheCoordinator::new(CacheConfig::at(dir.path()), gate));
    let router = build_router(coordinator, Router::new().route("/vault", get(render)));

    let unlock = format!("{UNLOCK_COOKIE_PREFIX}9={}", secret_digest("pw"));
    let requests = [None, Some(unlock.clone()), Some(unlock)];
    for cookie in requests {
        let mut builder = Request::builder().uri("/vault");
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        let response = router
            .clone()
            .oneshot(builder.body(Body::empty()).unwrap())
            .await
            .expect("response");
        let _ = axum::body::to_bytes(response.into_body(), usize::MAX).await;
    }

    let mut outcomes = HashSet::new();
    for (composite_key, _, _, value) in snapshotter.snapshot().into_vec() {
        let key = composite_key.key();
        if key.name() != "ppsc_cache_outcome_total" {
            continue;
        }
        let outcome = key
            .labels()
            .find(|label| label.key() == "outcome")
            .map(|label| label.value().to_string())
            .expect("outcome label");
        assert!(
            matches!(value, DebugValue::Counter(1)),
            "outcome {outcome} counted {value:?}"
        );
        outcomes.insert(outcome);
    }

    let expected: HashSet<String> = ["locked", "stored", "hit"]
        .into_iter()
        .map(str::to_string)
        .collect();
    assert_eq!(outcomes, expected);
}
