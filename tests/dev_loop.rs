//! The dev pipeline under change: incremental rebuilds, failure isolation
//! and what the server hands out meanwhile.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::*;
use http_body_util::BodyExt;
use sitepipe::flow::{Mode, tree_digest};
use sitepipe::pipeline::StageEvent;
use sitepipe::server::{LIVE_RELOAD_PATH, ReloadHub, ServerContext, create_router};
use sitepipe::watch::{PipelineRebuilder, WatchLoop, WatchRules, dev_watch_rules};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

async fn fetch(ctx: &ServerContext, uri: &str) -> (StatusCode, String) {
    let response = create_router(ctx.clone())
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&bytes).into_owned())
}

#[test]
fn incremental_rebuilds_match_full_runs() {
    let tmp = setup_fixtures();
    let project = project(&tmp);
    project.run(Mode::Dev, None).unwrap();

    let pipeline = project.pipeline(Mode::Dev);
    let flow = project.flow(Mode::Dev);
    let rules = WatchRules::new(dev_watch_rules(&project.config)).unwrap();

    let edits: [(&str, Option<&str>); 5] = [
        (
            "blog/_assets/css/jamie.css",
            Some(".lead { font-size: 2rem; user-select: all; }\n"),
        ),
        (
            "blog/posts/crossing-the-moor.md",
            Some("+++\ntitle = \"Crossing the moor\"\n+++\n\nRewritten.\n"),
        ),
        ("blog/posts/new-post.md", Some("# A new post\n\nFresh.\n")),
        ("blog/about.md", None),
        (
            "blog/_assets/js/main.js",
            Some("console.log(\"main\"); // changed\n"),
        ),
    ];

    for (file, contents) in edits {
        match contents {
            Some(text) => write(&tmp, file, text),
            None => fs::remove_file(tmp.path().join(file)).unwrap(),
        }
        let relative = Path::new(file).strip_prefix("blog").unwrap();
        let names: Vec<String> = rules
            .matching(relative)
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(names.len(), 1, "{file} should trigger exactly one rule");

        let stages = rules.stages_for(&names);
        pipeline
            .run_stages(&stages, &project.registry, &flow, None)
            .unwrap();
        let incremental = tree_digest(&flow.intermediate).unwrap();

        project.run(Mode::Dev, None).unwrap();
        let full = tree_digest(&flow.intermediate).unwrap();
        assert_eq!(incremental, full, "incremental output diverged after {file}");
    }

    assert!(!tmp.path().join(".tmp/about.html").exists());
    assert!(tmp.path().join(".tmp/posts/new-post.html").exists());
}

#[tokio::test]
async fn broken_stylesheet_keeps_serving_last_good_output() {
    let tmp = setup_fixtures();
    let project = project(&tmp);
    project.run(Mode::Dev, None).unwrap();
    let flow = project.flow(Mode::Dev);
    let good_css = read(&tmp, ".tmp/css/blog.css");

    let hub = ReloadHub::new();
    let ctx = ServerContext::new(flow.serve_roots(), Some(hub.clone()));
    let (event_tx, event_rx) = std::sync::mpsc::channel();
    let rebuilder = Arc::new(PipelineRebuilder {
        pipeline: project.pipeline(Mode::Dev),
        registry: Arc::clone(&project.registry),
        flow: flow.clone(),
        events: Some(event_tx),
    });
    let rules = WatchRules::new(dev_watch_rules(&project.config)).unwrap();
    let watch_loop = WatchLoop::new(
        flow.source.clone(),
        rules,
        Duration::from_millis(30),
        rebuilder,
        hub.clone(),
    );
    let (tx, rx) = tokio::sync::mpsc::channel(16);
    let task = tokio::spawn(watch_loop.run(rx));

    let hyde = flow.source.join("_assets/css/hyde.css");
    fs::write(&hyde, ".masthead { color: red;\n").unwrap();
    tx.send(hyde.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(hub.generation(), 0);
    assert_eq!(fetch(&ctx, "/css/blog.css").await, (StatusCode::OK, good_css));
    let (status, index) = fetch(&ctx, "/").await;
    assert_eq!(status, StatusCode::OK);
    assert!(index.contains(LIVE_RELOAD_PATH));

    fs::write(&hyde, ".masthead { color: red; }\n").unwrap();
    tx.send(hyde).await.unwrap();
    drop(tx);
    let summary = task.await.unwrap();

    assert_eq!(summary.rebuilds, 2);
    assert_eq!(summary.failures, 1);
    assert_eq!(summary.notifications, 1);
    assert_eq!(hub.generation(), 1);
    assert!(read(&tmp, ".tmp/css/blog.css").contains("color: red;"));

    let failed: Vec<String> = event_rx
        .try_iter()
        .filter_map(|event| match event {
            StageEvent::Failed { stage, .. } => Some(stage),
            _ => None,
        })
        .collect();
    assert_eq!(failed, vec!["concat-styles"]);
}

#[tokio::test]
async fn dev_server_falls_back_to_source_assets() {
    let tmp = setup_fixtures();
    let project = project(&tmp);
    project.run(Mode::Dev, None).unwrap();
    let ctx = ServerContext::new(project.flow(Mode::Dev).serve_roots(), None);

    let (status, svg) = fetch(&ctx, "/img/logo.svg").await;
    assert_eq!(status, StatusCode::OK);
    assert!(svg.contains("<metadata>"), "dev serves the unoptimized source");

    let (status, post) = fetch(&ctx, "/posts/crossing-the-moor").await;
    assert_eq!(status, StatusCode::OK);
    assert!(post.contains("Crossing the moor"));

    assert_eq!(fetch(&ctx, "/posts/unfinished").await.0, StatusCode::NOT_FOUND);
}
