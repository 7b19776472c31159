use std::time::Duration;

use wiremock::{Mock, MockServer, ResponseTemplate};
use wiremock::matchers::{method, path, header};

use gridllm::{
  GridSnapshot, ModelConfig, ModelStatus, SystemConfig
};
use gridllm::config::{GridllmConfig, StopTextPolicy};
use gridllm::session::GridllmEngine;

fn init_logging()
{   let _ = env_logger::builder()
      .is_test(true)
      .try_init();
}

fn test_config(server: &MockServer) -> GridllmConfig
{   GridllmConfig
    {   api_base: server.uri()
      , api_key: None
      , max_tokens: 50
      , stop_text: StopTextPolicy::default()
    }
}

fn grid(rows: usize, columns: usize) -> SystemConfig
{   SystemConfig
    {   grid_rows: rows
      , grid_columns: columns
      , system_prompt
          : "Continue the story.".to_string()
    }
}

fn chat_model(
  id: &str
, offset: usize
, completions: usize
) -> ModelConfig
{   ModelConfig
    {   id: id.to_string()
      , model: "test-model".to_string()
      , prompt_template: None
      , temperature: 1.0
      , stop_at_period: true
      , num_completions: completions
      , grid_offset: offset
      , max_tokens: None
      , color: "#e6f3ff".to_string()
    }
}

fn completion_model(
  id: &str
, offset: usize
, completions: usize
) -> ModelConfig
{   let mut model = chat_model(id, offset, completions);
    model.prompt_template = Some(
      "### Instruction: {system}\n\n\
       ### Response:{prompt}".to_string()
    );
    model
}

/// Event-stream body from raw JSON lines, terminated by the
/// [DONE] sentinel
fn sse_body(lines: &[&str]) -> String
{   let mut body = String::new();
    for line in lines
    {   body.push_str("data: ");
        body.push_str(line);
        body.push_str("\n\n");
    }
    body.push_str("data: [DONE]\n\n");
    body
}

fn sse_response(body: String) -> ResponseTemplate
{   ResponseTemplate::new(200)
      .set_body_raw(body, "text/event-stream")
}

/// Poll the engine until every model has drained to IDLE or
/// ERROR, then return the settled snapshot
async fn wait_for_drain(engine: &GridllmEngine)
  -> GridSnapshot
{   for _ in 0..200
    {   let snap = snapshot(engine).await;
        let drained = !snap.statuses.is_empty()
          && snap.statuses.values().all(|s| {
               *s == ModelStatus::Idle
                 || *s == ModelStatus::Error
             });
        if drained
        {   return snap;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("Grid never drained");
}

async fn snapshot(engine: &GridllmEngine) -> GridSnapshot
{   let mut rx = engine.grid_snapshot().await
      .expect("engine alive");
    rx.recv().await
      .expect("snapshot reply")
      .expect("snapshot")
}

// Scenario A: one model, one completion, stop with no
// stop_reason appends the default period
#[tokio::test]
async fn test_single_model_streams_into_slot()
{   init_logging();
    let server = MockServer::start().await;
    let body = sse_body(&[
      r#"{"choices":[{"index":0,"delta":{"content":"Hello"},"finish_reason":null}]}"#
    , r#"{"choices":[{"index":0,"delta":{"content":" world"},"finish_reason":null}]}"#
    , r#"{"choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#
    ]);
    Mock::given(method("POST"))
      .and(path("/v1/chat/completions"))
      .respond_with(sse_response(body))
      .mount(&server)
      .await;

    let engine = GridllmEngine::new(
      test_config(&server)
    , grid(1, 1)
    , vec![chat_model("m1", 0, 1)]
    );

    let mut rx = engine
      .start_generation("Once upon a time".to_string())
      .await
      .expect("engine alive");
    let session_id = rx.recv().await
      .expect("reply")
      .expect("session started");
    assert_eq!(session_id, 1);

    let snap = wait_for_drain(&engine).await;
    assert_eq!(
      snap.suggestions[0].text.as_deref()
    , Some("Hello world.")
    );
    assert_eq!(
      snap.suggestions[0].model_id.as_deref()
    , Some("m1")
    );
    assert_eq!(snap.statuses["m1"], ModelStatus::Idle);
    assert!(snap.errors.is_empty());

    engine.shutdown().await.expect("clean shutdown");
}

// Scenario B: one model's HTTP 500 is isolated; the other
// model's slots proceed to IDLE independently
#[tokio::test]
async fn test_model_failure_is_isolated()
{   init_logging();
    let server = MockServer::start().await;

    Mock::given(method("POST"))
      .and(path("/v1/chat/completions"))
      .respond_with(ResponseTemplate::new(500))
      .mount(&server)
      .await;

    let body = sse_body(&[
      r#"{"choices":[{"index":0,"text":"b0","finish_reason":null},{"index":1,"text":"b1","finish_reason":null},{"index":2,"text":"b2","finish_reason":null},{"index":3,"text":"b3","finish_reason":null}]}"#
    , r#"{"choices":[{"index":0,"finish_reason":"stop"},{"index":1,"finish_reason":"stop"},{"index":2,"finish_reason":"stop"},{"index":3,"finish_reason":"stop"}]}"#
    ]);
    Mock::given(method("POST"))
      .and(path("/v1/completions"))
      .respond_with(sse_response(body))
      .mount(&server)
      .await;

    let engine = GridllmEngine::new(
      test_config(&server)
    , grid(2, 4)
    , vec![
        chat_model("a", 0, 4)
      , completion_model("b", 4, 4)
      ]
    );

    let mut rx = engine
      .start_generation("Once".to_string())
      .await
      .expect("engine alive");
    rx.recv().await
      .expect("reply")
      .expect("session started");

    let snap = wait_for_drain(&engine).await;

    assert_eq!(snap.statuses["a"], ModelStatus::Error);
    assert!(snap.errors["a"].contains("500"));
    for index in 0..4
    {   assert_eq!(snap.suggestions[index].text, None);
    }

    assert_eq!(snap.statuses["b"], ModelStatus::Idle);
    assert_eq!(
      snap.suggestions[4].text.as_deref()
    , Some("b0.")
    );
    assert_eq!(
      snap.suggestions[7].text.as_deref()
    , Some("b3.")
    );

    engine.shutdown().await.expect("clean shutdown");
}

// Scenario D: a second session supersedes the first; the slot
// only ever reflects the second session's output
#[tokio::test]
async fn test_supersession_discards_stale_session()
{   init_logging();
    let server = MockServer::start().await;

    let old_body = sse_body(&[
      r#"{"choices":[{"index":0,"delta":{"content":"OLD"},"finish_reason":null}]}"#
    , r#"{"choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#
    ]);
    Mock::given(method("POST"))
      .and(path("/v1/chat/completions"))
      .respond_with(
        sse_response(old_body)
          .set_delay(Duration::from_millis(400))
      )
      .up_to_n_times(1)
      .mount(&server)
      .await;

    let new_body = sse_body(&[
      r#"{"choices":[{"index":0,"delta":{"content":"NEW"},"finish_reason":null}]}"#
    , r#"{"choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#
    ]);
    Mock::given(method("POST"))
      .and(path("/v1/chat/completions"))
      .respond_with(sse_response(new_body))
      .mount(&server)
      .await;

    let engine = GridllmEngine::new(
      test_config(&server)
    , grid(1, 1)
    , vec![chat_model("m1", 0, 1)]
    );

    let mut rx = engine
      .start_generation("first".to_string())
      .await
      .expect("engine alive");
    let first = rx.recv().await
      .expect("reply")
      .expect("session started");
    assert_eq!(first, 1);

    // Let the first request get in flight, then supersede it
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut rx = engine
      .start_generation("second".to_string())
      .await
      .expect("engine alive");
    let second = rx.recv().await
      .expect("reply")
      .expect("session started");
    assert_eq!(second, 2);

    let snap = wait_for_drain(&engine).await;
    assert_eq!(
      snap.suggestions[0].text.as_deref()
    , Some("NEW.")
    );

    // Even after the first session's delayed response could
    // have landed, nothing attributable to it may appear
    tokio::time::sleep(Duration::from_millis(600)).await;
    let snap = snapshot(&engine).await;
    assert_eq!(
      snap.suggestions[0].text.as_deref()
    , Some("NEW.")
    );
    assert_eq!(snap.session_id, 2);

    engine.shutdown().await.expect("clean shutdown");
}

// A stream that closes without finish_reason is force-
// completed with the partial text preserved
#[tokio::test]
async fn test_forced_completion_preserves_partial_text()
{   init_logging();
    let server = MockServer::start().await;

    // No stop chunk and no [DONE]; connection just closes
    let body = "data: {\"choices\":[{\"index\":0,\
      \"delta\":{\"content\":\"partial\"},\
      \"finish_reason\":null}]}\n\n"
      .to_string();
    Mock::given(method("POST"))
      .and(path("/v1/chat/completions"))
      .respond_with(sse_response(body))
      .mount(&server)
      .await;

    let engine = GridllmEngine::new(
      test_config(&server)
    , grid(1, 1)
    , vec![chat_model("m1", 0, 1)]
    );

    let mut rx = engine
      .start_generation("Once".to_string())
      .await
      .expect("engine alive");
    rx.recv().await
      .expect("reply")
      .expect("session started");

    let snap = wait_for_drain(&engine).await;
    assert_eq!(
      snap.suggestions[0].text.as_deref()
    , Some("partial")
    );
    assert_eq!(snap.statuses["m1"], ModelStatus::Idle);
    assert!(snap.errors.is_empty());

    engine.shutdown().await.expect("clean shutdown");
}

#[tokio::test]
async fn test_cancel_generation_stops_mutations()
{   init_logging();
    let server = MockServer::start().await;

    let body = sse_body(&[
      r#"{"choices":[{"index":0,"delta":{"content":"late"},"finish_reason":null}]}"#
    , r#"{"choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#
    ]);
    Mock::given(method("POST"))
      .and(path("/v1/chat/completions"))
      .respond_with(
        sse_response(body)
          .set_delay(Duration::from_millis(300))
      )
      .mount(&server)
      .await;

    let engine = GridllmEngine::new(
      test_config(&server)
    , grid(1, 1)
    , vec![chat_model("m1", 0, 1)]
    );

    let mut rx = engine
      .start_generation("Once".to_string())
      .await
      .expect("engine alive");
    rx.recv().await
      .expect("reply")
      .expect("session started");

    let mut rx = engine.cancel_generation().await
      .expect("engine alive");
    rx.recv().await
      .expect("reply")
      .expect("cancel is not an error");

    let snap = snapshot(&engine).await;
    assert_eq!(snap.statuses["m1"], ModelStatus::Idle);

    // Late data from the aborted request must never land
    tokio::time::sleep(Duration::from_millis(500)).await;
    let snap = snapshot(&engine).await;
    assert_eq!(snap.suggestions[0].text, None);
    assert!(snap.errors.is_empty());

    engine.shutdown().await.expect("clean shutdown");
}

#[tokio::test]
async fn test_generation_without_models_is_rejected()
{   init_logging();
    let server = MockServer::start().await;

    let engine = GridllmEngine::new(
      test_config(&server)
    , grid(1, 1)
    , vec![]
    );

    let mut rx = engine
      .start_generation("Once".to_string())
      .await
      .expect("engine alive");
    let result = rx.recv().await.expect("reply");
    assert_eq!(
      result
    , Err(gridllm::error::Error::NoModelsConfigured)
    );

    engine.shutdown().await.expect("clean shutdown");
}

#[tokio::test]
async fn test_invalid_configuration_is_rejected()
{   init_logging();
    let server = MockServer::start().await;

    let engine = GridllmEngine::new(
      test_config(&server)
    , grid(2, 4)
    , vec![chat_model("a", 0, 4)]
    );

    // Overlapping ranges
    let mut rx = engine
      .set_model_configs(vec![
        chat_model("a", 0, 4)
      , chat_model("b", 3, 4)
      ])
      .await
      .expect("engine alive");
    let result = rx.recv().await.expect("reply");
    assert!(matches!(
      result
    , Err(gridllm::error::Error::InvalidConfiguration(_))
    ));

    // Shrinking the grid below the configured models
    let mut rx = engine
      .set_system_config(grid(1, 2))
      .await
      .expect("engine alive");
    let result = rx.recv().await.expect("reply");
    assert!(matches!(
      result
    , Err(gridllm::error::Error::InvalidConfiguration(_))
    ));

    engine.shutdown().await.expect("clean shutdown");
}

#[tokio::test]
async fn test_mark_inserted_flags_slot()
{   init_logging();
    let server = MockServer::start().await;

    let engine = GridllmEngine::new(
      test_config(&server)
    , grid(1, 1)
    , vec![chat_model("m1", 0, 1)]
    );

    let mut rx = engine.mark_inserted(0).await
      .expect("engine alive");
    rx.recv().await
      .expect("reply")
      .expect("slot in range");

    let snap = snapshot(&engine).await;
    assert!(snap.suggestions[0].inserted);

    let mut rx = engine.mark_inserted(3).await
      .expect("engine alive");
    let result = rx.recv().await.expect("reply");
    assert_eq!(
      result
    , Err(gridllm::error::Error::SlotOutOfRange(3))
    );

    engine.shutdown().await.expect("clean shutdown");
}

#[tokio::test]
async fn test_available_models_lists_catalog()
{   init_logging();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
      .and(path("/v1/models"))
      .and(header("Authorization", "Bearer test-key"))
      .respond_with(
        ResponseTemplate::new(200).set_body_raw(
          r#"{"object":"list","data":[
            {"id":"m-small","created":1736000000,
             "owned_by":"acme"},
            {"id":"m-large","created":1736000001,
             "owned_by":"acme"}
          ]}"#
        , "application/json"
        )
      )
      .mount(&server)
      .await;

    let mut config = test_config(&server);
    config.api_key = Some("test-key".to_string());

    let engine = GridllmEngine::new(
      config
    , grid(1, 1)
    , vec![chat_model("m1", 0, 1)]
    );

    let mut rx = engine.available_models().await
      .expect("engine alive");
    let models = rx.recv().await
      .expect("reply")
      .expect("catalog fetched");

    assert_eq!(models.len(), 2);
    assert_eq!(models[0].id, "m-small");
    assert_eq!(models[0].owned_by, "acme");
    assert_eq!(models[1].id, "m-large");

    engine.shutdown().await.expect("clean shutdown");
}

#[tokio::test]
async fn test_available_models_reports_http_failure()
{   init_logging();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
      .and(path("/v1/models"))
      .respond_with(ResponseTemplate::new(503))
      .mount(&server)
      .await;

    let engine = GridllmEngine::new(
      test_config(&server)
    , grid(1, 1)
    , vec![chat_model("m1", 0, 1)]
    );

    let mut rx = engine.available_models().await
      .expect("engine alive");
    let result = rx.recv().await.expect("reply");
    match result
    {   Err(gridllm::error::Error::HttpError(message)) => {
          assert!(message.contains("503"));
        }
      , other => panic!("Expected HttpError, got {:?}", other)
    }

    engine.shutdown().await.expect("clean shutdown");
}

#[tokio::test]
async fn test_bearer_token_is_sent()
{   init_logging();
    let server = MockServer::start().await;

    let body = sse_body(&[
      r#"{"choices":[{"index":0,"delta":{"content":"ok"},"finish_reason":null}]}"#
    , r#"{"choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#
    ]);
    Mock::given(method("POST"))
      .and(path("/v1/chat/completions"))
      .and(header("Authorization", "Bearer test-key"))
      .respond_with(sse_response(body))
      .mount(&server)
      .await;

    let mut config = test_config(&server);
    config.api_key = Some("test-key".to_string());

    let engine = GridllmEngine::new(
      config
    , grid(1, 1)
    , vec![chat_model("m1", 0, 1)]
    );

    let mut rx = engine
      .start_generation("Once".to_string())
      .await
      .expect("engine alive");
    rx.recv().await
      .expect("reply")
      .expect("session started");

    // Without the header the mock would 404 and the model
    // would land in ERROR
    let snap = wait_for_drain(&engine).await;
    assert_eq!(snap.statuses["m1"], ModelStatus::Idle);

    engine.shutdown().await.expect("clean shutdown");
}
