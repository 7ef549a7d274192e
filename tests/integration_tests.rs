//! Integration tests for workflow loading and execution
//!
//! These tests drive the engine end to end through its public API, playing
//! the part of the external executor by submitting step results.

use chrono::{Duration, Utc};
use kinetic_flow::backend::{InMemoryBackend, Signal};
use kinetic_flow::config::EngineConfig;
use kinetic_flow::engine::{ActionType, Engine, InstanceStatus, NextStep};
use kinetic_flow::workflow::WorkflowDefinition;
use serde_json::{json, Value};
use std::io::Write;
use std::sync::Arc;
use uuid::Uuid;

fn engine() -> Engine {
    Engine::new(EngineConfig::default())
}

fn shell_result(output: &str) -> Value {
    json!({"output": output, "error_output": "", "status": 0})
}

async fn children_of(engine: &Engine, id: Uuid) -> Vec<Uuid> {
    engine
        .query_status(id)
        .await
        .unwrap()
        .children
        .into_iter()
        .map(|c| c.instance_id)
        .collect()
}

async fn status_of(engine: &Engine, id: Uuid) -> InstanceStatus {
    engine.query_status(id).await.unwrap().status
}

// ============================================================================
// Definitions & Loading
// ============================================================================

#[tokio::test]
async fn test_load_file_uses_definition_cache() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        "name: cached\nversion: \"1.2\"\nsteps:\n  - id: done\n    type: terminate\n    value: 1\n"
    )
    .unwrap();

    let engine = engine();
    let first = engine.load_file(file.path()).await.unwrap();
    let second = engine.load_file(file.path()).await.unwrap();
    assert_eq!(first, "cached@1.2");
    assert_eq!(first, second);

    let stats = engine.cache().stats().await;
    assert_eq!((stats.hits, stats.misses), (1, 1));

    let response = engine.start("cached", json!({})).await.unwrap();
    assert_eq!(response.status, InstanceStatus::Completed);
    assert_eq!(response.result, Some(json!(1)));
}

#[tokio::test]
async fn test_invalid_definition_reports_all_issues() {
    let err = engine()
        .register_yaml(
            r#"
name: broken
version: 1
steps:
  - id: a
    type: shel
    command: ls
  - id: a
    type: wait
"#,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "definition_error");
    assert!(err.to_string().contains("unknown_step_type"));
    assert!(err.to_string().contains("missing_field"));
}

// ============================================================================
// State & Control Flow
// ============================================================================

#[tokio::test]
async fn test_undeclared_state_read_rejected_by_validator() {
    let err = engine()
        .register_yaml(
            r#"
name: leaky
version: 1
initial_state:
  secret: s3cr3t
steps:
  - id: leak
    type: shell
    command: "echo {{ secret }}"
"#,
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("undeclared_state_read"));
}

#[tokio::test]
async fn test_undeclared_state_read_fails_before_dispatch() {
    // Registered without validation so the runtime check is what catches it
    let def: WorkflowDefinition = serde_yaml::from_str(
        r#"
name: leaky
version: 1
initial_state:
  secret: s3cr3t
steps:
  - id: leak
    type: shell
    command: "echo {{ secret }}"
"#,
    )
    .unwrap();
    let engine = engine();
    engine.register(def).await.unwrap();

    let response = engine.start("leaky", json!({})).await.unwrap();
    assert_eq!(response.status, InstanceStatus::Failed);
    assert!(response.action.is_none());
    let error = response.error.unwrap();
    assert_eq!(error.kind, "state_access_violation");
    assert_eq!(error.step_id.as_deref(), Some("leak"));
    assert_eq!(error.fragment.as_deref(), Some("secret"));
}

#[tokio::test]
async fn test_state_update_recomputes_dependents() {
    let engine = engine();
    engine
        .register_yaml(
            r#"
name: sums
version: 1
initial_state:
  a: 2
  b: 3
  total: 0
computed:
  double: total * 2
steps:
  - id: add
    type: state_update
    needs_state: [a, b]
    updates:
      raw.total: a + b
"#,
        )
        .await
        .unwrap();

    let response = engine.start("sums", json!({})).await.unwrap();
    let result = response.result.unwrap();
    assert_eq!(result["total"], json!(5));
    assert_eq!(result["double"], json!(10));
}

#[tokio::test]
async fn test_failed_update_leaves_state_untouched() {
    let engine = engine();
    engine
        .register_yaml(
            r#"
name: atomic
version: 1
initial_state:
  a: 1
steps:
  - id: update
    type: state_update
    needs_state: [a]
    updates:
      raw.a: "50"
      raw.b: a / 0
"#,
        )
        .await
        .unwrap();

    let response = engine.start("atomic", json!({})).await.unwrap();
    assert_eq!(response.status, InstanceStatus::Failed);
    assert_eq!(response.error.unwrap().kind, "type_mismatch");

    let state = engine.get_state(response.instance_id).await.unwrap();
    assert_eq!(state.get("a"), Some(&json!(1)));
    assert!(state.get("b").is_none());
}

#[tokio::test]
async fn test_branch_on_input() {
    let engine = engine();
    engine
        .register_yaml(
            r#"
name: grade
version: 1
inputs:
  score:
    type: integer
    minimum: 0
    maximum: 100
steps:
  - id: check
    type: branch
    condition: score >= 70
    then:
      - id: pass
        type: state_update
        updates:
          raw.grade: "'pass'"
    else:
      - id: fail
        type: state_update
        updates:
          raw.grade: "'fail'"
"#,
        )
        .await
        .unwrap();

    let passed = engine.start("grade", json!({"score": 72})).await.unwrap();
    assert_eq!(passed.result.unwrap()["grade"], json!("pass"));

    let failed = engine.start("grade", json!({"score": 40})).await.unwrap();
    assert_eq!(failed.result.unwrap()["grade"], json!("fail"));

    let err = engine.start("grade", json!({"score": 140})).await.unwrap_err();
    assert_eq!(err.kind(), "invalid_inputs");
}

// ============================================================================
// Suspend & Resume
// ============================================================================

#[tokio::test]
async fn test_shell_step_suspends_and_resumes() {
    let engine = engine();
    engine
        .register_yaml(
            r#"
name: greet
version: 1
inputs:
  x:
    type: string
steps:
  - id: say
    type: shell
    command: "echo {{ x }}"
    output_to: raw.said
"#,
        )
        .await
        .unwrap();

    let started = engine.start("greet", json!({"x": "hello"})).await.unwrap();
    assert_eq!(started.status, InstanceStatus::Suspended);
    let action = started.action.unwrap();
    assert_eq!(action.action, ActionType::Shell);
    assert_eq!(action.params["command"], json!("echo hello"));

    let done = engine
        .submit_result(started.instance_id, "say", shell_result("hello\n"))
        .await
        .unwrap();
    assert_eq!(done.status, InstanceStatus::Completed);
    assert_eq!(done.result.unwrap()["said"]["output"], json!("hello\n"));

    let err = engine
        .submit_result(started.instance_id, "say", shell_result("again\n"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "result_already_consumed");
}

const PLAIN_TEXT: &str = r#"
name: plain
version: 1
steps:
  - id: status
    type: shell
    command: git status
  - id: confirm
    type: wait
    message: "ready?"
"#;

async fn assert_plain_text_suspends(engine: &Engine) {
    let started = engine.start("plain", json!({})).await.unwrap();
    assert_eq!(started.status, InstanceStatus::Suspended);
    let action = started.action.unwrap();
    assert_eq!(action.step_id, "status");
    assert_eq!(action.params["command"], json!("git status"));

    let next = engine
        .submit_result(started.instance_id, "status", shell_result("clean\n"))
        .await
        .unwrap();
    assert_eq!(next.status, InstanceStatus::Suspended);
    let action = next.action.unwrap();
    assert_eq!(action.action, ActionType::Wait);
    assert_eq!(action.params["message"], json!("ready?"));
}

#[tokio::test]
async fn test_plain_text_steps_validate_and_suspend() {
    let engine = engine();
    engine.register_yaml(PLAIN_TEXT).await.unwrap();
    assert_plain_text_suspends(&engine).await;
}

#[tokio::test]
async fn test_plain_text_steps_pass_runtime_access_check() {
    let def: WorkflowDefinition = serde_yaml::from_str(PLAIN_TEXT).unwrap();
    let engine = engine();
    engine.register(def).await.unwrap();
    assert_plain_text_suspends(&engine).await;
}

#[tokio::test]
async fn test_overdue_action_expires() {
    let engine = engine();
    engine
        .register_yaml("name: slow\nversion: 1\nsteps:\n  - id: build\n    type: shell\n    command: make\n    timeout: 30\n")
        .await
        .unwrap();
    let id = engine.start("slow", json!({})).await.unwrap().instance_id;

    assert!(engine.expire_overdue().await.unwrap().is_empty());
    let expired = engine
        .expire_overdue_at(Utc::now() + Duration::seconds(31))
        .await
        .unwrap();
    assert_eq!(expired, vec![id]);

    let report = engine.query_status(id).await.unwrap();
    assert_eq!(report.status, InstanceStatus::Failed);
    assert_eq!(report.error.unwrap().kind, "external_result_timeout");
    assert!(report.pending.is_none());

    let err = engine
        .submit_result(id, "build", shell_result(""))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "instance_finished");
}

// ============================================================================
// Iteration & Delegation
// ============================================================================

const ECHO_EACH: &str = r#"
name: echo_each
version: 1
tasks:
  echo_item:
    - id: run
      type: shell
      command: "echo {{ item }}"
      output_to: raw.run
    - id: finish
      type: terminate
      needs_state: [run]
      value: run.output
steps:
  - id: each
    type: iterate
    items: "[1, 2, 3]"
    task: echo_item
    mode: MODE
    output_to: raw.outputs
"#;

#[tokio::test]
async fn test_parallel_results_keep_item_order() {
    let engine = engine();
    engine
        .register_yaml(&ECHO_EACH.replace("MODE", "parallel"))
        .await
        .unwrap();
    let started = engine.start("echo_each", json!({})).await.unwrap();
    assert_eq!(started.status, InstanceStatus::WaitingOnChildren);

    let root = started.instance_id;
    let children = children_of(&engine, root).await;
    assert_eq!(children.len(), 3);
    for child in &children {
        assert_eq!(status_of(&engine, *child).await, InstanceStatus::Suspended);
    }
    let listed: Vec<Uuid> = started.actions.iter().map(|a| a.instance_id).collect();
    assert_eq!(listed, children);
    assert_eq!(started.action.as_ref(), started.actions.first());

    // Finish in reverse order
    for (index, child) in children.iter().enumerate().rev() {
        let pending = engine.query_status(*child).await.unwrap().pending.unwrap();
        assert_eq!(pending.params["command"], json!(format!("echo {}", index + 1)));
        engine
            .submit_result(*child, "run", shell_result(&format!("out-{}", index + 1)))
            .await
            .unwrap();
    }

    let report = engine.query_status(root).await.unwrap();
    assert_eq!(report.status, InstanceStatus::Completed);
    assert_eq!(
        report.result.unwrap()["outputs"],
        json!(["out-1", "out-2", "out-3"])
    );
}

#[tokio::test]
async fn test_sequential_children_run_one_at_a_time() {
    let engine = engine();
    engine
        .register_yaml(&ECHO_EACH.replace("MODE", "sequential"))
        .await
        .unwrap();
    let root = engine.start("echo_each", json!({})).await.unwrap().instance_id;
    let children = children_of(&engine, root).await;

    for (index, child) in children.iter().enumerate() {
        for (other_index, other) in children.iter().enumerate() {
            let expected = match other_index.cmp(&index) {
                std::cmp::Ordering::Less => InstanceStatus::Completed,
                std::cmp::Ordering::Equal => InstanceStatus::Suspended,
                std::cmp::Ordering::Greater => InstanceStatus::Queued,
            };
            assert_eq!(status_of(&engine, *other).await, expected);
        }
        engine
            .submit_result(*child, "run", shell_result(&format!("seq-{}", index)))
            .await
            .unwrap();
    }

    let report = engine.query_status(root).await.unwrap();
    assert_eq!(
        report.result.unwrap()["outputs"],
        json!(["seq-0", "seq-1", "seq-2"])
    );
}

#[tokio::test]
async fn test_local_iteration_collects_terminate_values() {
    let engine = engine();
    engine
        .register_yaml(
            r#"
name: doubler
version: 1
inputs:
  numbers:
    type: array
steps:
  - id: each
    type: iterate
    items: numbers
    output_to: raw.doubled
    steps:
      - id: double
        type: terminate
        value: item * 2
"#,
        )
        .await
        .unwrap();

    let response = engine
        .start("doubler", json!({"numbers": [1, 2, 3]}))
        .await
        .unwrap();
    assert_eq!(response.status, InstanceStatus::Completed);
    assert_eq!(response.result.unwrap()["doubled"], json!([2, 4, 6]));

    let empty = engine.start("doubler", json!({"numbers": []})).await.unwrap();
    assert_eq!(empty.status, InstanceStatus::Completed);
    assert_eq!(empty.result.unwrap()["doubled"], json!([]));
}

#[tokio::test]
async fn test_delegated_iteration_via_child_protocol() {
    let engine = engine();
    engine
        .register_yaml(
            r#"
name: fanout
version: 1
steps:
  - id: each
    type: iterate
    items: "['a', 'b']"
    executor: reviewer
    max_concurrency: 1
    output_to: raw.reviews
    steps:
      - id: review
        type: prompt
        prompt: "review {{ item }}"
        output_to: raw.review
      - id: done
        type: terminate
        needs_state: [review]
        value: review
"#,
        )
        .await
        .unwrap();

    let started = engine.start("fanout", json!({})).await.unwrap();
    let root = started.instance_id;
    let action = started.action.unwrap();
    assert_eq!(action.action, ActionType::DelegateIteration);
    assert_eq!(action.params["executor"], json!("reviewer"));
    let children: Vec<Uuid> = serde_json::from_value(action.params["children"].clone()).unwrap();
    assert_eq!(children, children_of(&engine, root).await);

    let err = engine
        .submit_result(root, "each", json!({"output": []}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "not_awaiting_result");

    assert_eq!(engine.get_next_step(children[1]).await.unwrap(), NextStep::Blocked);

    for (child, item) in children.iter().zip(["a", "b"]) {
        let NextStep::Action { action } = engine.get_next_step(*child).await.unwrap() else {
            panic!("child should have a prompt to answer");
        };
        assert_eq!(action.params["prompt"], json!(format!("review {}", item)));
        let ack = engine
            .submit_step_result(*child, "review", json!({"response": format!("ok-{}", item)}))
            .await
            .unwrap();
        assert_eq!(ack.status, InstanceStatus::Completed);
    }

    let report = engine.query_status(root).await.unwrap();
    assert_eq!(report.status, InstanceStatus::Completed);
    assert_eq!(report.result.unwrap()["reviews"], json!(["ok-a", "ok-b"]));
    assert!(matches!(
        engine.get_next_step(children[0]).await.unwrap(),
        NextStep::Complete { status: InstanceStatus::Completed, .. }
    ));
}

const WAIT_EACH: &str = r#"
name: wait_each
version: 1
steps:
  - id: each
    type: iterate
    items: "[1, 2]"
    continue_on_error: CONTINUE
    output_to: raw.answers
    steps:
      - id: ask
        type: wait
        message: "item {{ item }}"
        output_to: raw.answer
      - id: done
        type: terminate
        needs_state: [answer]
        value: answer
"#;

#[tokio::test]
async fn test_cancelled_child_fails_parent() {
    let engine = engine();
    engine
        .register_yaml(&WAIT_EACH.replace("CONTINUE", "false"))
        .await
        .unwrap();
    let root = engine.start("wait_each", json!({})).await.unwrap().instance_id;
    let children = children_of(&engine, root).await;

    let response = engine.cancel(children[0]).await.unwrap();
    assert_eq!(response.instance_id, root);
    assert_eq!(response.status, InstanceStatus::WaitingOnChildren);

    let response = engine
        .submit_result(children[1], "ask", json!({"value": "yes"}))
        .await
        .unwrap();
    assert_eq!(response.status, InstanceStatus::Failed);
    let error = response.error.unwrap();
    assert_eq!(error.kind, "child_failures");
    assert!(error.message.contains("[0]"));
}

#[tokio::test]
async fn test_continue_on_error_keeps_partial_results() {
    let engine = engine();
    engine
        .register_yaml(&WAIT_EACH.replace("CONTINUE", "true"))
        .await
        .unwrap();
    let root = engine.start("wait_each", json!({})).await.unwrap().instance_id;
    let children = children_of(&engine, root).await;

    engine.cancel(children[0]).await.unwrap();
    let response = engine
        .submit_result(children[1], "ask", json!({"value": "yes"}))
        .await
        .unwrap();
    assert_eq!(response.status, InstanceStatus::Completed);
    assert_eq!(response.result.unwrap()["answers"], json!([null, "yes"]));
}

#[tokio::test]
async fn test_cancel_reaches_every_descendant() {
    let backend = Arc::new(InMemoryBackend::new());
    let engine = Engine::with_backend(EngineConfig::default(), backend.clone());
    engine
        .register_yaml(&WAIT_EACH.replace("CONTINUE", "false"))
        .await
        .unwrap();
    let root = engine.start("wait_each", json!({})).await.unwrap().instance_id;
    let children = children_of(&engine, root).await;

    let response = engine.cancel(root).await.unwrap();
    assert_eq!(response.status, InstanceStatus::Cancelled);
    assert!(response.action.is_none());
    for child in &children {
        assert_eq!(status_of(&engine, *child).await, InstanceStatus::Cancelled);
    }
    assert!(backend
        .signals()
        .await
        .contains(&(root, Signal::Cancel)));

    let err = engine.cancel(root).await.unwrap_err();
    assert_eq!(err.kind(), "instance_finished");
    let err = engine
        .submit_result(children[0], "ask", json!({"value": 1}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "instance_finished");
}
