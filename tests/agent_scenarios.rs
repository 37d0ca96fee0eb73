use std::sync::Arc;

use troupe_agent::{DependencyGraph, FnAction, LifecycleState, NodeStatus, Role};
use troupe_core::config::{AgentConfig, AppConfig, MemoryBackend, ReactMode};
use troupe_core::error::TroupeError;
use troupe_core::traits::MessageStore;
use troupe_core::types::{ActionContext, ActionOutput, MessageFilter};
use troupe_memory::MessageBus;
use troupe_test_utils::{run_log, user_message, FlakyAction, RecordingAction};

#[tokio::test]
async fn reactive_role_answers_each_message_once() {
    let store = Arc::new(MessageBus::new());
    let mut role = Role::new("assistant", store.clone())
        .with_config(&AgentConfig {
            react_mode: ReactMode::React,
            max_loop: 3,
            ..AgentConfig::default()
        })
        .with_action(RecordingAction::new("answer", run_log()))
        .unwrap();

    for text in ["first", "second", "third"] {
        role.run(Some(user_message(text))).await.unwrap();
        assert_eq!(role.state(), LifecycleState::Idle);
    }

    let replies = store
        .search(&MessageFilter::new().sent_from("assistant"))
        .await
        .unwrap();
    assert_eq!(replies.len(), 3);
}

#[tokio::test]
async fn roles_hand_work_along_the_bus() {
    let store = Arc::new(MessageBus::new());
    let log = run_log();

    let mut pm = Role::new("pm", store.clone())
        .with_action(RecordingAction::new("write_prd", log.clone()).with_content("PRD: snake game"))
        .unwrap();
    let mut engineer = Role::new("engineer", store.clone())
        .watching(["write_prd"])
        .with_action_triggered_by(
            FnAction::new("write_code", |ctx: ActionContext| async move {
                let prd = ctx.latest_content().unwrap_or_default().to_string();
                Ok(ActionOutput::completed(format!("code for [{prd}]")))
            }),
            "write_prd",
        )
        .unwrap();
    let mut qa = Role::new("qa", store.clone())
        .watching(["write_code"])
        .with_action_triggered_by(RecordingAction::new("write_test", log.clone()), "write_code")
        .unwrap();

    pm.run(Some(user_message("make a snake game"))).await.unwrap();
    // The engineer does not watch user input, and qa has nothing yet
    assert!(qa.run(None).await.unwrap().is_none());

    let code = engineer.run(None).await.unwrap().unwrap();
    assert_eq!(code.content(), "code for [PRD: snake game]");
    assert_eq!(code.cause_by().as_str(), "write_code");

    let tests = qa.run(None).await.unwrap().unwrap();
    assert_eq!(tests.sent_from(), "qa");

    let all = store.get().await.unwrap();
    let senders: Vec<&str> = all.iter().map(|m| m.sent_from()).collect();
    assert_eq!(senders, vec!["user", "pm", "engineer", "qa"]);
}

#[tokio::test]
async fn diamond_graph_respects_dependencies() {
    let log = run_log();
    let mut graph = DependencyGraph::new();
    let a = graph.add_node(Arc::new(RecordingAction::new("A", log.clone())));
    let b = graph.add_node(Arc::new(RecordingAction::new("B", log.clone())));
    let c = graph.add_node(Arc::new(RecordingAction::new("C", log.clone())));
    let d = graph.add_node(Arc::new(RecordingAction::new("D", log.clone())));
    graph.add_edge(&a, &b).unwrap();
    graph.add_edge(&a, &c).unwrap();
    graph.add_edge(&b, &d).unwrap();
    graph.add_edge(&c, &d).unwrap();

    let dot = graph.to_dot();
    for edge in ["A->B", "A->C", "B->D", "C->D"] {
        assert!(dot.contains(edge));
    }

    graph.execute(None).await.unwrap();
    let ran = log.lock().unwrap().clone();
    let pos = |n: &str| ran.iter().position(|x| x == n).unwrap();
    assert_eq!(ran.len(), 4);
    assert_eq!(pos("A"), 0);
    assert_eq!(pos("D"), 3);
    assert_eq!(graph.status(), NodeStatus::Completed);
}

#[tokio::test]
async fn cyclic_graph_never_starts() {
    let log = run_log();
    let mut graph = DependencyGraph::new();
    let a = graph.add_node(Arc::new(RecordingAction::new("A", log.clone())));
    let b = graph.add_node(Arc::new(RecordingAction::new("B", log.clone())));
    let c = graph.add_node(Arc::new(RecordingAction::new("C", log.clone())));
    graph.add_edge(&a, &b).unwrap();
    graph.add_edge(&b, &c).unwrap();
    graph.add_edge(&c, &a).unwrap();

    let err = graph.execute(None).await.unwrap_err();
    assert!(matches!(err, TroupeError::CycleDetected { .. }));
    assert!(err.is_structural());
    assert!(graph.nodes().all(|n| n.status() == NodeStatus::Pending));
    assert!(log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn retry_feeds_failures_back_through_memory() {
    let store = Arc::new(MessageBus::new());
    let flaky = FlakyAction::new("execute_code", 2);
    let mut role = Role::new("analyst", store.clone())
        .with_config(&AgentConfig {
            max_retry: 3,
            ..AgentConfig::default()
        })
        .with_retrying_action(flaky)
        .unwrap();

    let report = role
        .run(Some(user_message("plot the data")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.content(), "succeeded on attempt 3");
    assert_eq!(report.payload().unwrap()["attempts"], serde_json::json!(3));

    let failures = store
        .search(&MessageFilter::new().cause_by("execute_code").content_contains("failed"))
        .await
        .unwrap();
    assert_eq!(failures.len(), 2);
}

#[tokio::test]
async fn role_from_config_uses_sqlite_store() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default();
    config.memory.backend = MemoryBackend::Sqlite;
    config.memory.path = dir.path().join("bus.db").display().to_string();
    config.agent.react_mode = ReactMode::ByOrder;
    config.agent.max_loop = 2;

    let mut role = Role::from_config("writer", &config)
        .unwrap()
        .with_action(RecordingAction::new("outline", run_log()))
        .unwrap()
        .with_action(RecordingAction::new("draft", run_log()))
        .unwrap();

    role.store().add(user_message("an essay on rust")).await.unwrap();
    let produced = role.start().await.unwrap();
    assert_eq!(produced.len(), 2);
    assert_eq!(role.store().len().await.unwrap(), 3);
}
