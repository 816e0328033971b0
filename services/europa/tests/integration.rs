//! Integration tests for the registry

use std::collections::BTreeSet;
use std::sync::Arc;

use api_client::mock::MockService;
use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use axum::response::Response;
use bytes::Bytes;
use europa::pipeline::{ManualPromotion, Pipeline, PipelineComponent, run_manual_promotion};
use europa::repo::{ContainerRepo, RegistryProvider};
use europa::sync::{ImageSyncTask, MonitorOutcome, RepoMonitorTask, SyncTask, UpstreamImages};
use europa::{
    CopyImageBetweenRepos, Digest, ObjectStore, RegistryBuilder, RegistryContext, RegistryResult,
};
use serde_json::{Value, json};
use storage::{MemoryStorage, Storage};
use tower::ServiceExt;

struct TestRegistry {
    app: Router,
    ctx: RegistryContext,
    memory: Arc<MemoryStorage>,
}

/// Helper to create a test registry
fn test_registry() -> TestRegistry {
    let memory = Arc::new(MemoryStorage::with_buckets(&["registry"]));
    let objects = ObjectStore::new(Storage::new(memory.clone()).bucket("registry"));
    let ctx = RegistryContext::new(objects, api_client::shared_service(MockService::new()));
    let app = RegistryBuilder::new()
        .context(ctx.clone())
        .domain("acme")
        .build()
        .unwrap();
    TestRegistry { app, ctx, memory }
}

impl TestRegistry {
    async fn send(&self, request: Request<Body>) -> Response {
        self.app.clone().oneshot(request).await.unwrap()
    }

    async fn get(&self, uri: &str) -> Response {
        self.send(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
    }

    /// Upload `data` in one chunk followed by a closing PUT.
    async fn upload_blob(&self, name: &str, data: &[u8]) -> Digest {
        let digest = Digest::of(data);
        let response = self
            .send(
                Request::builder()
                    .method("POST")
                    .uri(format!("/v2/{name}/blobs/uploads/"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let location = response.headers()[header::LOCATION]
            .to_str()
            .unwrap()
            .to_string();

        let (first, rest) = data.split_at(data.len() / 2);
        let response = self
            .send(
                Request::builder()
                    .method("PATCH")
                    .uri(&location)
                    .body(Body::from(Bytes::copy_from_slice(first)))
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let response = self
            .send(
                Request::builder()
                    .method("PUT")
                    .uri(format!("{location}?digest={digest}"))
                    .body(Body::from(Bytes::copy_from_slice(rest)))
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            response.headers()["docker-content-digest"],
            digest.as_str()
        );
        digest
    }

    async fn put_manifest(&self, name: &str, reference: &str, body: &Bytes) -> Response {
        self.send(
            Request::builder()
                .method("PUT")
                .uri(format!("/v2/{name}/manifests/{reference}"))
                .header(
                    header::CONTENT_TYPE,
                    "application/vnd.docker.distribution.manifest.v2+json",
                )
                .body(Body::from(body.clone()))
                .unwrap(),
        )
        .await
    }
}

async fn body_bytes(response: Response) -> Bytes {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
}

async fn body_json(response: Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

fn manifest(config: &Digest, layers: &[&Digest]) -> Bytes {
    let layers: Vec<Value> = layers
        .iter()
        .map(|digest| {
            json!({
                "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
                "digest": digest,
                "size": 32,
            })
        })
        .collect();
    serde_json::to_vec(&json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
        "config": {
            "mediaType": "application/vnd.docker.container.image.v1+json",
            "digest": config,
            "size": 16,
        },
        "layers": layers,
    }))
    .unwrap()
    .into()
}

#[tokio::test]
async fn test_api_version_check() {
    let registry = test_registry();
    let response = registry.get("/v2/").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["docker-distribution-api-version"],
        "registry/2.0"
    );
}

#[tokio::test]
async fn test_push_requires_uploaded_blobs() {
    let registry = test_registry();
    let d1 = Digest::of(b"config blob");
    let d2 = Digest::of(b"layer blob");
    let body = manifest(&d1, &[&d2]);

    let response = registry.put_manifest("app", "v1", &body).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let error = body_json(response).await;
    assert_eq!(error["errors"][0]["code"], "BLOB_UNKNOWN");
    assert_eq!(error["errors"][0]["detail"].as_array().unwrap().len(), 2);

    registry.upload_blob("app", b"config blob").await;
    registry.upload_blob("app", b"layer blob").await;

    let response = registry.put_manifest("app", "v1", &body).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let digest = Digest::of(&body);
    assert_eq!(
        response.headers()["docker-content-digest"],
        digest.as_str()
    );
    assert_eq!(
        response.headers()[header::LOCATION],
        format!("/v2/app/manifests/{digest}").as_str()
    );

    let response = registry.get(&format!("/v2/app/manifests/{digest}")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, body);

    let response = registry.get("/v2/app/manifests/v1").await;
    assert_eq!(
        response.headers()["docker-content-digest"],
        digest.as_str()
    );

    let tags = body_json(registry.get("/v2/app/tags/list").await).await;
    assert_eq!(tags, json!({"name": "app", "tags": ["v1"]}));

    let response = registry.get(&format!("/v2/app/blobs/{d2}")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(&body_bytes(response).await[..], b"layer blob");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_pushes_share_a_repository() {
    let registry = test_registry();
    let config = registry.upload_blob("base", b"config").await;
    let body = manifest(&config, &[]);

    let mut handles = Vec::new();
    for index in 0..20 {
        for tag in ["v1", "v2"] {
            let app = registry.app.clone();
            let body = body.clone();
            handles.push(tokio::spawn(async move {
                let request = Request::builder()
                    .method("PUT")
                    .uri(format!("/v2/app{index}/manifests/{tag}"))
                    .header(
                        header::CONTENT_TYPE,
                        "application/vnd.docker.distribution.manifest.v2+json",
                    )
                    .body(Body::from(body))
                    .unwrap();
                app.oneshot(request).await.unwrap().status()
            }));
        }
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap(), StatusCode::CREATED);
    }

    for index in 0..20 {
        let tags = body_json(registry.get(&format!("/v2/app{index}/tags/list")).await).await;
        assert_eq!(tags["tags"], json!(["v1", "v2"]));
    }
}

#[tokio::test]
async fn test_blobs_are_stored_once() {
    let registry = test_registry();
    let first = registry.upload_blob("app", b"shared layer").await;
    let second = registry.upload_blob("other", b"shared layer").await;
    assert_eq!(first, second);
    assert_eq!(registry.memory.object_count("registry").await, 1);

    let response = registry
        .send(
            Request::builder()
                .method("HEAD")
                .uri(format!("/v2/other/blobs/{first}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "12");
}

#[tokio::test]
async fn test_monolithic_upload_and_mount() {
    let registry = test_registry();
    let digest = Digest::of(b"one shot");
    let response = registry
        .send(
            Request::builder()
                .method("POST")
                .uri(format!("/v2/app/blobs/uploads/?digest={digest}"))
                .body(Body::from("one shot"))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = registry
        .send(
            Request::builder()
                .method("POST")
                .uri(format!("/v2/other/blobs/uploads/?mount={digest}&from=app"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(
        response.headers()[header::LOCATION],
        format!("/v2/other/blobs/{digest}").as_str()
    );

    let wrong = Digest::of(b"something else");
    let response = registry
        .send(
            Request::builder()
                .method("POST")
                .uri(format!("/v2/app/blobs/uploads/?digest={wrong}"))
                .body(Body::from("one shot"))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["errors"][0]["code"], "DIGEST_INVALID");
}

#[tokio::test]
async fn test_tag_listing_pages() {
    let registry = test_registry();
    let config = registry.upload_blob("app", b"config").await;
    let body = manifest(&config, &[]);
    for tag in ["a", "b", "c"] {
        let response = registry.put_manifest("app", tag, &body).await;
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    let response = registry.get("/v2/app/tags/list?n=2").await;
    assert_eq!(
        response.headers()[header::LINK],
        "</v2/app/tags/list?last=b&n=2>; rel=\"next\""
    );
    assert_eq!(body_json(response).await["tags"], json!(["a", "b"]));

    let response = registry.get("/v2/app/tags/list?n=2&last=b").await;
    assert!(response.headers().get(header::LINK).is_none());
    assert_eq!(body_json(response).await["tags"], json!(["c"]));

    let catalog = body_json(registry.get("/v2/_catalog").await).await;
    assert_eq!(catalog, json!({"repositories": ["app"]}));
}

#[tokio::test]
async fn test_oversized_page_request_lists_everything() {
    let registry = test_registry();
    let config = registry.upload_blob("app", b"config").await;
    let body = manifest(&config, &[]);
    for tag in ["a", "b"] {
        registry.put_manifest("app", tag, &body).await;
    }

    let response = registry
        .get(&format!("/v2/app/tags/list?n={}", usize::MAX))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(header::LINK).is_none());
    assert_eq!(body_json(response).await["tags"], json!(["a", "b"]));

    let response = registry.get(&format!("/v2/_catalog?n={}", usize::MAX)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["repositories"], json!(["app"]));
}

#[tokio::test]
async fn test_delete_by_digest_removes_every_tag() {
    let registry = test_registry();
    let config = registry.upload_blob("app", b"config").await;
    let body = manifest(&config, &[]);
    let digest = Digest::of(&body);
    registry.put_manifest("app", "v1", &body).await;
    registry.put_manifest("app", "latest", &body).await;

    let response = registry
        .send(
            Request::builder()
                .method("DELETE")
                .uri("/v2/app/manifests/latest")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let tags = body_json(registry.get("/v2/app/tags/list").await).await;
    assert_eq!(tags["tags"], json!(["v1"]));

    let response = registry
        .send(
            Request::builder()
                .method("DELETE")
                .uri(format!("/v2/app/manifests/{digest}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let response = registry.get(&format!("/v2/app/manifests/{digest}")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["errors"][0]["code"], "MANIFEST_UNKNOWN");
}

#[tokio::test]
async fn test_unknown_repository() {
    let registry = test_registry();
    let response = registry.get("/v2/missing/manifests/v1").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["errors"][0]["code"], "NAME_UNKNOWN");
}

#[tokio::test]
async fn test_local_copy_touches_no_objects() {
    let registry = test_registry();
    let config = registry.upload_blob("app-dev", b"config").await;
    let body = manifest(&config, &[]);
    registry.put_manifest("app-dev", "v1", &body).await;

    let ctx = &registry.ctx;
    let dev = ctx.repos.get_local_repo("acme", "app-dev").await.unwrap().unwrap();
    let prod = ctx
        .repos
        .save(ContainerRepo::local("acme", "prod", "app-prod"))
        .await
        .unwrap();

    let before = registry.memory.operations();
    CopyImageBetweenRepos::builder()
        .source_repo(dev)
        .source_reference("v1")
        .destination_repo(prod)
        .destination_tag("stable")
        .build()
        .unwrap()
        .run(ctx)
        .await
        .unwrap();
    assert_eq!(registry.memory.operations(), before);

    let response = registry.get("/v2/app-prod/manifests/stable").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, body);
}

#[tokio::test]
async fn test_manual_gate_resumes_promotion() {
    let registry = test_registry();
    let ctx = &registry.ctx;
    for (id, name) in [("dev", "app-dev"), ("qa", "app-qa"), ("prod", "app-prod")] {
        ctx.repos
            .save(ContainerRepo::local("acme", id, name))
            .await
            .unwrap();
    }

    let gate = PipelineComponent::manual_promotion_gate();
    let gate_id = match &gate {
        PipelineComponent::ManualPromotionGate { id } => id.clone(),
        PipelineComponent::CopyToRepository { .. } => unreachable!(),
    };
    let mut pipeline = Pipeline::new("acme", "release", Some("dev"));
    pipeline
        .add_component(PipelineComponent::copy_to_repository("qa", None), None)
        .unwrap();
    pipeline.add_component(gate, None).unwrap();
    pipeline
        .add_component(
            PipelineComponent::copy_to_repository("prod", Some("release")),
            None,
        )
        .unwrap();
    let pipeline = ctx.pipelines.save(pipeline).await.unwrap();

    let config = registry.upload_blob("app-dev", b"config").await;
    let body = manifest(&config, &[]);
    let response = registry.put_manifest("app-dev", "v1", &body).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    assert_eq!(registry.get("/v2/app-qa/manifests/v1").await.status(), StatusCode::OK);
    assert_eq!(
        registry.get("/v2/app-prod/manifests/release").await.status(),
        StatusCode::NOT_FOUND
    );

    let outcome = run_manual_promotion(
        ctx,
        &ManualPromotion {
            domain: "acme".into(),
            pipeline_id: pipeline.id.clone(),
            component_id: gate_id,
            source_repo_id: "qa".into(),
            source_tag: "v1".into(),
            destination_tag: None,
        },
    )
    .await
    .unwrap();
    assert!(outcome.completed());
    assert_eq!(outcome.image.repo.id, "prod");

    let response = registry.get("/v2/app-prod/manifests/release").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, body);
}

#[derive(Debug)]
struct FixedUpstream(Vec<(String, Digest)>);

#[async_trait]
impl UpstreamImages for FixedUpstream {
    async fn list_images(
        &self,
        _ctx: &RegistryContext,
        _repo: &ContainerRepo,
    ) -> RegistryResult<Vec<(String, Digest)>> {
        Ok(self.0.clone())
    }
}

fn tag(tag: &str, digest: &Digest) -> (String, Digest) {
    (tag.to_string(), digest.clone())
}

/// A DockerHub source `s1` mirrored into the local cache `m1`.
async fn mirrored_source(ctx: &RegistryContext) -> ContainerRepo {
    ctx.repos
        .save(ContainerRepo::local_mirror("acme", "m1", "app-cache"))
        .await
        .unwrap();
    let mut source =
        ContainerRepo::remote("acme", "s1", "library/app", RegistryProvider::DockerHub, None);
    source.sync_destination_container_repo_ids = BTreeSet::from(["m1".to_string()]);
    ctx.repos.save(source).await.unwrap()
}

#[tokio::test]
async fn test_only_one_monitor_wins_the_lock() {
    let registry = test_registry();
    let ctx = &registry.ctx;
    let source = mirrored_source(ctx).await;
    let upstream = Arc::new(FixedUpstream(vec![tag("v1", &Digest::of(b"m1"))]));

    let first = RepoMonitorTask::new(&source).with_upstream(upstream.clone());
    let second = RepoMonitorTask::new(&source).with_upstream(upstream);
    let (first, second) = tokio::join!(first.run(ctx), second.run(ctx));
    let outcomes = [first.unwrap(), second.unwrap()];

    let skipped = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, MonitorOutcome::Skipped))
        .count();
    assert_eq!(skipped, 1);

    let source = ctx.repos.get_repo("acme", "s1").await.unwrap().unwrap();
    assert_eq!(source.sync_count, 1);
    assert!(source.last_sync_time.is_some());
}

#[tokio::test]
async fn test_monitor_replicates_only_changes() {
    let registry = test_registry();
    let ctx = &registry.ctx;
    let source = mirrored_source(ctx).await;
    let d1 = Digest::of(b"image one");
    let d2 = Digest::of(b"image two");
    let d3 = Digest::of(b"image three");

    let initial = Arc::new(FixedUpstream(vec![
        tag("v0", &d1),
        tag("v1", &d1),
        tag("latest", &d2),
    ]));
    let outcome = RepoMonitorTask::new(&source)
        .with_upstream(initial)
        .run(ctx)
        .await
        .unwrap();
    assert!(matches!(outcome, MonitorOutcome::Synced { tasks: 2, .. }));

    // The mirror already holds the three original tags.
    while let Some(task) = ctx.tasks.pop().await.unwrap() {
        let SyncTask::Image(task) = task else {
            panic!("unexpected repo sync task");
        };
        let digest = task.manifest_digest_sha.clone().unwrap();
        for tag in &task.image_tags {
            let mut row = ctx
                .manifests
                .get_manifest("acme", "s1", tag)
                .await
                .unwrap()
                .unwrap();
            row.container_repo_id = "m1".into();
            assert_eq!(row.manifest_id, digest);
            ctx.manifests.put(row).await.unwrap();
        }
    }

    let source = ctx.repos.get_repo("acme", "s1").await.unwrap().unwrap();
    let changed = Arc::new(FixedUpstream(vec![
        tag("v1", &d1),
        tag("latest", &d2),
        tag("v2", &d3),
    ]));
    let outcome = RepoMonitorTask::new(&source)
        .with_upstream(changed)
        .run(ctx)
        .await
        .unwrap();
    let MonitorOutcome::Synced { changes, tasks } = outcome else {
        panic!("monitor did not acquire the lock");
    };
    assert_eq!(tasks, 2);
    assert_eq!(changes.removed, ["v0"]);

    let mut additions = Vec::new();
    while let Some(task) = ctx.tasks.pop().await.unwrap() {
        let SyncTask::Image(image) = &task else {
            panic!("unexpected task {task:?}");
        };
        match &image.manifest_digest_sha {
            Some(_) => additions.push(image.clone()),
            None => task.run(ctx).await.unwrap(),
        }
    }
    assert_eq!(
        additions,
        [ImageSyncTask {
            domain: "acme".into(),
            source_repo_id: "s1".into(),
            destination_repo_id: "m1".into(),
            image_tags: vec!["v2".into()],
            manifest_digest_sha: Some(d3.clone()),
        }]
    );

    assert!(ctx.manifests.get_manifest("acme", "m1", "v0").await.unwrap().is_none());
    for (tag, digest) in [("v1", &d1), ("latest", &d2)] {
        let row = ctx
            .manifests
            .get_manifest("acme", "m1", tag)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&row.manifest_id, digest);
    }
}

#[tokio::test]
async fn test_monitor_prunes_deleted_destinations() {
    let registry = test_registry();
    let ctx = &registry.ctx;
    mirrored_source(ctx).await;
    ctx.repos
        .save(ContainerRepo::local_mirror("acme", "m2", "app-cache-two"))
        .await
        .unwrap();
    ctx.repos.add_sync_destination("acme", "s1", "m2").await.unwrap();
    ctx.repos.delete_repo("acme", "m2").await.unwrap();

    let source = ctx.repos.get_repo("acme", "s1").await.unwrap().unwrap();
    let upstream = Arc::new(FixedUpstream(vec![tag("v1", &Digest::of(b"image"))]));
    let outcome = RepoMonitorTask::new(&source)
        .with_upstream(upstream)
        .run(ctx)
        .await
        .unwrap();
    assert!(matches!(outcome, MonitorOutcome::Synced { tasks: 1, .. }));

    let source = ctx.repos.get_repo("acme", "s1").await.unwrap().unwrap();
    assert_eq!(
        source.sync_destination_container_repo_ids,
        BTreeSet::from(["m1".to_string()])
    );
}
