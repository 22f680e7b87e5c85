#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use eventsource_stream::Eventsource;
use futures::StreamExt;
use opthub_core::Config;
use opthub_server::AppState;
use opthub_server::build_state;
use opthub_server::router;
use pretty_assertions::assert_eq;
use serde_json::Value;
use serde_json::json;

async fn start_server(config: Config) -> (SocketAddr, Arc<AppState>) {
    let state = build_state(config);
    let app = router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr, state)
}

fn quick_config() -> Config {
    Config {
        workers: 2,
        queue_capacity: 32,
        hard_timeout: Duration::from_secs(30),
        soft_grace: Duration::from_secs(5),
        ..Config::default()
    }
}

fn sphere_submission(algorithms: &[&str]) -> Value {
    json!({
        "problem": {
            "n": 2,
            "bounds": [[-5.0, 5.0], [-5.0, 5.0]],
            "objective": "minimize",
            "fitness": "sphere",
        },
        "algorithms": algorithms,
        "params": {
            "swarm_size": 30.0,
            "max_iterations": 50.0,
            "w": 0.7,
            "c1": 1.5,
            "c2": 1.5,
        },
    })
}

async fn poll_until_terminal(client: &reqwest::Client, addr: SocketAddr, id: &str) -> Value {
    for _ in 0..600 {
        let response = client
            .get(format!("http://{addr}/async/tasks/{id}"))
            .send()
            .await
            .expect("poll request");
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let body: Value = response.json().await.expect("poll body");
        let state = body["state"].as_str().unwrap_or_default().to_string();
        if state == "SUCCESS" || state == "FAILURE" {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("task {id} did not reach a terminal state");
}

#[tokio::test]
async fn happy_path_benchmark_submission_streams_to_success() {
    let (addr, _state) = start_server(quick_config()).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{addr}/async/optimize"))
        .json(&sphere_submission(&["particle_swarm"]))
        .send()
        .await
        .expect("submit");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: Value = response.json().await.expect("submit body");
    let task_ids = body["task_ids"].as_array().expect("task_ids");
    assert_eq!(task_ids.len(), 1);
    let id = task_ids[0].as_str().expect("task id");

    let stream_response = client
        .get(format!("http://{addr}/api/async/tasks/{id}/stream"))
        .send()
        .await
        .expect("open stream");
    assert_eq!(
        stream_response
            .headers()
            .get("content-type")
            .and_then(|value| value.to_str().ok()),
        Some("text/event-stream")
    );

    let mut states = Vec::new();
    let mut terminal_frame = None;
    let mut events = stream_response.bytes_stream().eventsource();
    while let Some(event) = events.next().await {
        let event = event.expect("event frame");
        let frame: Value = serde_json::from_str(&event.data).expect("frame json");
        let state = frame["state"].as_str().unwrap_or_default().to_string();
        states.push(state.clone());
        if state == "SUCCESS" || state == "FAILURE" {
            terminal_frame = Some(frame);
            break;
        }
    }

    // Observed states are a prefix-respecting subsequence of the lifecycle,
    // each at most once; a fast job may fuse early states away.
    let expected_order = ["PENDING", "STARTED", "SUCCESS"];
    let mut cursor = 0;
    for state in &states {
        let position = expected_order[cursor..]
            .iter()
            .position(|expected| expected == state)
            .unwrap_or_else(|| panic!("unexpected state order: {states:?}"));
        cursor += position + 1;
    }

    let frame = terminal_frame.expect("terminal frame");
    assert_eq!(frame["state"], "SUCCESS");
    let result = &frame["result"];
    assert!(result["best_fitness"].as_f64().expect("best_fitness") < 1e-2);
    assert!(result["iterations_completed"].as_u64().expect("iterations") <= 50);
}

#[tokio::test]
async fn multi_algorithm_group_progresses_independently() {
    let (addr, _state) = start_server(quick_config()).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{addr}/async/optimize"))
        .json(&sphere_submission(&[
            "particle_swarm",
            "genetic_algorithm",
            "ant_colony",
        ]))
        .send()
        .await
        .expect("submit");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: Value = response.json().await.expect("submit body");
    assert!(body["group_id"].is_string());
    let task_ids: Vec<String> = body["task_ids"]
        .as_array()
        .expect("task_ids")
        .iter()
        .filter_map(|id| id.as_str().map(str::to_string))
        .collect();
    assert_eq!(task_ids.len(), 3);

    for id in &task_ids {
        let terminal = poll_until_terminal(&client, addr, id).await;
        assert_eq!(terminal["state"], "SUCCESS", "task {id}: {terminal}");
    }
}

#[tokio::test]
async fn identical_submissions_get_distinct_ids() {
    let (addr, _state) = start_server(quick_config()).await;
    let client = reqwest::Client::new();

    let mut seen = Vec::new();
    for _ in 0..2 {
        let response = client
            .post(format!("http://{addr}/async/optimize"))
            .json(&sphere_submission(&["particle_swarm"]))
            .send()
            .await
            .expect("submit");
        let body: Value = response.json().await.expect("body");
        seen.push(body["task_ids"][0].as_str().expect("id").to_string());
    }
    assert_ne!(seen[0], seen[1]);
}

#[tokio::test]
async fn unknown_task_polls_as_not_found() {
    let (addr, _state) = start_server(quick_config()).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!(
            "http://{addr}/async/tasks/00000000-0000-4000-8000-000000000000"
        ))
        .send()
        .await
        .expect("poll");
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    let body: Value = response.json().await.expect("body");
    assert_eq!(body["detail"]["error_type"], "unknown_job");
}

#[tokio::test]
async fn unknown_task_stream_emits_one_frame_and_closes() {
    let (addr, _state) = start_server(quick_config()).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!(
            "http://{addr}/api/async/tasks/00000000-0000-4000-8000-000000000000/stream"
        ))
        .send()
        .await
        .expect("open stream");
    let mut events = response.bytes_stream().eventsource();
    let mut frames = Vec::new();
    while let Some(event) = events.next().await {
        frames.push(event.expect("event"));
    }
    assert_eq!(frames.len(), 1);
    let frame: Value = serde_json::from_str(&frames[0].data).expect("frame json");
    assert_eq!(frame["state"], "unknown");
}

#[tokio::test]
async fn late_subscriber_receives_exactly_the_terminal_frame() {
    let (addr, _state) = start_server(quick_config()).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{addr}/async/optimize"))
        .json(&sphere_submission(&["particle_swarm"]))
        .send()
        .await
        .expect("submit");
    let body: Value = response.json().await.expect("body");
    let id = body["task_ids"][0].as_str().expect("id").to_string();

    let terminal = poll_until_terminal(&client, addr, &id).await;
    assert_eq!(terminal["state"], "SUCCESS");

    let stream_response = client
        .get(format!("http://{addr}/api/async/tasks/{id}/stream"))
        .send()
        .await
        .expect("open stream");
    let mut events = stream_response.bytes_stream().eventsource();
    let mut frames = Vec::new();
    while let Some(event) = events.next().await {
        frames.push(event.expect("event"));
    }
    assert_eq!(frames.len(), 1);
    let frame: Value = serde_json::from_str(&frames[0].data).expect("frame json");
    assert_eq!(frame["state"], "SUCCESS");
    assert!(frame["result"]["best_fitness"].is_number());
}

#[tokio::test]
async fn terminal_job_polls_identically_twice() {
    let (addr, _state) = start_server(quick_config()).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{addr}/async/optimize"))
        .json(&sphere_submission(&["differential_evolution"]))
        .send()
        .await
        .expect("submit");
    let body: Value = response.json().await.expect("body");
    let id = body["task_ids"][0].as_str().expect("id").to_string();

    let first = poll_until_terminal(&client, addr, &id).await;
    let second = poll_until_terminal(&client, addr, &id).await;
    assert_eq!(first, second);
}

#[tokio::test]
async fn malformed_problem_is_rejected_at_the_boundary() {
    let (addr, _state) = start_server(quick_config()).await;
    let client = reqwest::Client::new();

    // bounds count does not match the dimensionality
    let response = client
        .post(format!("http://{addr}/async/optimize"))
        .json(&json!({
            "problem": {
                "n": 3,
                "bounds": [[-5.0, 5.0]],
                "objective": "minimize",
                "fitness": "sphere",
            },
            "algorithms": ["particle_swarm"],
        }))
        .send()
        .await
        .expect("submit");
    assert_eq!(response.status(), reqwest::StatusCode::UNPROCESSABLE_ENTITY);
    let body: Value = response.json().await.expect("body");
    assert_eq!(body["detail"]["error_type"], "validation");
}

#[tokio::test]
async fn unknown_algorithm_is_rejected_for_the_whole_group() {
    let (addr, state) = start_server(quick_config()).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{addr}/async/optimize"))
        .json(&sphere_submission(&["particle_swarm", "gradient_descent"]))
        .send()
        .await
        .expect("submit");
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.expect("body");
    assert_eq!(body["detail"]["error_type"], "validation");
    assert!(
        body["detail"]["message"]
            .as_str()
            .unwrap_or_default()
            .contains("gradient_descent")
    );
    // Nothing was enqueued.
    assert!(state.store.is_empty());
}

#[tokio::test]
async fn custom_endpoint_rejects_forbidden_import_without_sandboxing() {
    let (addr, _state) = start_server(quick_config()).await;
    let client = reqwest::Client::new();

    let form = reqwest::multipart::Form::new()
        .part(
            "fitness_file",
            reqwest::multipart::Part::text("import os\n\ndef fitness(x):\n    return 0\n")
                .file_name("fitness.py"),
        )
        .part(
            "config_file",
            reqwest::multipart::Part::text(custom_config_yaml()).file_name("config.yaml"),
        );
    let response = client
        .post(format!("http://{addr}/api/optimize/custom"))
        .multipart(form)
        .send()
        .await
        .expect("custom submit");
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.expect("body");
    assert_eq!(body["detail"]["error_type"], "validation");
    assert!(
        body["detail"]["message"]
            .as_str()
            .unwrap_or_default()
            .contains("os"),
        "{body}"
    );
}

#[tokio::test]
async fn custom_endpoint_requires_python_suffix() {
    let (addr, _state) = start_server(quick_config()).await;
    let client = reqwest::Client::new();

    let form = reqwest::multipart::Form::new()
        .part(
            "fitness_file",
            reqwest::multipart::Part::text("def fitness(x):\n    return 0\n")
                .file_name("fitness.txt"),
        )
        .part(
            "config_file",
            reqwest::multipart::Part::text(custom_config_yaml()).file_name("config.yaml"),
        );
    let response = client
        .post(format!("http://{addr}/api/optimize/custom"))
        .multipart(form)
        .send()
        .await
        .expect("custom submit");
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
}

/// Full sandbox round trip; needs the opthub-sandbox binary plus a
/// Landlock-capable kernel, so it is opt-in.
#[tokio::test]
#[ignore = "requires the opthub-sandbox binary and a Landlock-capable kernel"]
async fn custom_endpoint_runs_user_fitness_in_the_sandbox() {
    let (addr, _state) = start_server(quick_config()).await;
    let client = reqwest::Client::new();

    let form = reqwest::multipart::Form::new()
        .part(
            "fitness_file",
            reqwest::multipart::Part::text(
                "def fitness(x):\n    return sum([xi * xi for xi in x])\n",
            )
            .file_name("fitness.py"),
        )
        .part(
            "config_file",
            reqwest::multipart::Part::text(custom_config_yaml()).file_name("config.yaml"),
        );
    let response = client
        .post(format!("http://{addr}/api/optimize/custom"))
        .multipart(form)
        .send()
        .await
        .expect("custom submit");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: Value = response.json().await.expect("body");
    assert!(body["best_fitness"].as_f64().expect("best_fitness") < 1.0);
}

/// Runaway user fitness must come back as a timeout, not hang the server.
#[tokio::test]
#[ignore = "requires the opthub-sandbox binary and a Landlock-capable kernel"]
async fn custom_endpoint_times_out_runaway_fitness() {
    let mut config = quick_config();
    config.hard_timeout = Duration::from_secs(3);
    config.soft_grace = Duration::from_secs(1);
    let (addr, _state) = start_server(config).await;
    let client = reqwest::Client::new();

    let source = "def fitness(x):\n    t = 0\n    for i in range(1000000000):\n        t += i\n    return t\n";
    let form = reqwest::multipart::Form::new()
        .part(
            "fitness_file",
            reqwest::multipart::Part::text(source).file_name("fitness.py"),
        )
        .part(
            "config_file",
            reqwest::multipart::Part::text(custom_config_yaml()).file_name("config.yaml"),
        );
    let response = client
        .post(format!("http://{addr}/api/optimize/custom"))
        .multipart(form)
        .send()
        .await
        .expect("custom submit");
    assert_eq!(response.status(), reqwest::StatusCode::GATEWAY_TIMEOUT);
    let body: Value = response.json().await.expect("body");
    assert_eq!(body["detail"]["error_type"], "timeout");
}

fn custom_config_yaml() -> String {
    r#"
algorithm: particle_swarm
params:
  swarm_size: 10
  max_iterations: 10
problem:
  dim: 3
  bounds:
    - [-5.0, 5.0]
    - [-5.0, 5.0]
    - [-5.0, 5.0]
  objective: minimize
"#
    .to_string()
}
