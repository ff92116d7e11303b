#![cfg(unix)]

use std::{collections::HashSet, path::Path, sync::Arc, time::Duration};

use metrics_util::debugging::DebuggingRecorder;
use pagesnap::{
    config::WorkerSettings,
    domain::render::RenderRequest,
    infra::worker::{SessionState, WorkerSession},
};
use tempfile::TempDir;

fn session(dir: &Path, body: &str) -> WorkerSession {
    std::fs::create_dir_all(dir).expect("stub dir");
    let script = dir.join("worker.sh");
    std::fs::write(&script, body).expect("write stub worker");
    let mut settings = WorkerSettings::new("/bin/sh", script);
    settings.timeouts.initial_render_response = Duration::from_millis(200);
    settings.timeouts.render_response = Duration::from_secs(5);
    settings.timeouts.shutdown_grace = Duration::from_millis(200);
    WorkerSession::new(settings).expect("session")
}

#[tokio::test]
async fn worker_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    let dir = TempDir::new().expect("tmp dir");

    // Start, timeout, then a successful exchange on the same worker.
    let slow_first = session(
        &dir.path().join("slow"),
        r#"
n=0
while IFS= read -r line; do
  [ "$line" = "exit" ] && exit 0
  n=$((n+1))
  [ "$n" -eq 1 ] && sleep 1
  echo '{"status":"ok"}'
done
"#,
    );
    let request =
        RenderRequest::new("http://example.com/").with_page_load_timeout(Duration::from_millis(100));
    let timed_out = slow_first.render(&request).await.expect("render");
    assert!(!timed_out.is_ok());
    let answered = slow_first.render(&request).await.expect("render");
    assert!(answered.is_ok());
    slow_first.shutdown(None).await;

    // Forced kill while an exchange holds the guard.
    let stuck = Arc::new(session(
        &dir.path().join("stuck"),
        "IFS= read -r line\nexec sleep 30\n",
    ));
    let render = {
        let stuck = Arc::clone(&stuck);
        tokio::spawn(async move { stuck.render(&RenderRequest::new("http://example.com/")).await })
    };
    while stuck.state() != SessionState::Running {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    stuck.shutdown(Some(Duration::ZERO)).await;
    assert!(render.await.expect("join").is_err());

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "pagesnap_worker_starts_total",
        "pagesnap_render_total",
        "pagesnap_render_timeouts_total",
        "pagesnap_render_ms",
        "pagesnap_worker_forced_kills_total",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
