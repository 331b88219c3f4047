use std::sync::Arc;
use std::time::Duration;

use deskmate::core::automation::{Action, RecordingAutomation};
use deskmate::core::handlers::{HandlerRegistry, HandlerSettings, UserDirs};
use deskmate::core::journal::{EntryKind, Journal};
use deskmate::{Assistant, CodeExecutor, Config, ExecutionMode, IntentCatalogue, IntentMatcher, Reply};
use tempfile::TempDir;

fn catalogue(base: &std::path::Path) -> Arc<IntentCatalogue> {
    let settings = HandlerSettings {
        settle_delay: Duration::ZERO,
        dirs: UserDirs::rooted(base),
    };
    let registry = HandlerRegistry::with_builtins(settings);
    Arc::new(IntentCatalogue::builtin(&registry).unwrap())
}

fn config(base: &std::path::Path) -> Config {
    Config {
        data_dir: base.join("data"),
        sandbox_timeout: Duration::from_secs(5),
        ..Config::default()
    }
}

#[test]
fn test_parsed_intent_json_shape() {
    let dir = TempDir::new().unwrap();
    let catalogue = catalogue(dir.path());
    assert_eq!(catalogue.len(), 15);
    let matcher = IntentMatcher::new(catalogue);

    let json = matcher.parse("take a screenshot").unwrap().to_json();
    assert_eq!(json["intent"], "take_screenshot");
    assert_eq!(json["category"], "automation");
    assert_eq!(json["raw_text"], "take a screenshot");
    let confidence = json["confidence"].as_f64().unwrap();
    assert!((0.7..=1.0).contains(&confidence));

    assert!(matcher.parse("flibbertigibbet").is_none());
}

#[test]
fn test_schema_export_round_trips() {
    let dir = TempDir::new().unwrap();
    let catalogue = catalogue(dir.path());
    let registry = HandlerRegistry::with_builtins(HandlerSettings {
        settle_delay: Duration::ZERO,
        dirs: UserDirs::rooted(dir.path()),
    });
    let json = catalogue.to_schema_json().unwrap();
    let reloaded = IntentCatalogue::from_schema_json(&json, &registry).unwrap();
    assert_eq!(reloaded.len(), catalogue.len());
    assert_eq!(reloaded.fingerprint(), catalogue.fingerprint());
}

#[tokio::test]
async fn test_assistant_runs_intents_and_code() {
    let dir = TempDir::new().unwrap();
    let config = config(dir.path());
    let automation = Arc::new(RecordingAutomation::new());
    let mut assistant = Assistant::new(
        &config,
        catalogue(dir.path()),
        automation.clone(),
        Journal::new(config.journal_path()),
    );

    let reply = assistant.handle("open calculator").await;
    assert!(reply.success(), "{}", reply.message());
    assert!(automation
        .actions()
        .iter()
        .any(|action| matches!(action, Action::Launch(_))));

    let reply = assistant.handle("create file todo.txt").await;
    assert!(reply.success(), "{}", reply.message());
    assert!(dir.path().join("work").join("todo.txt").exists());

    let reply = assistant
        .handle("run this code:\n```python\nnumbers = [1, 2, 3, 4]\nprint(sum(n * n for n in numbers))\n```")
        .await;
    match &reply {
        Reply::Code(result) => {
            assert!(result.success, "{:?}", result.error);
            assert_eq!(result.output, "30\n");
        }
        other => panic!("expected a code reply, got {:?}", other),
    }

    let reply = assistant.handle("flibbertigibbet").await;
    assert!(matches!(reply, Reply::NotUnderstood(_)));

    let kinds: Vec<EntryKind> = assistant.journal().last_n(4).iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![EntryKind::Intent, EntryKind::Intent, EntryKind::Code, EntryKind::Unrecognized]
    );

    assistant.shutdown();
    let mut reloaded = Journal::new(config.journal_path());
    reloaded.load().unwrap();
    assert_eq!(reloaded.len(), 4);
}

#[tokio::test]
async fn test_sandbox_modes_from_the_public_api() {
    let dir = TempDir::new().unwrap();
    let sandbox = CodeExecutor::new(&config(dir.path()));

    let blocked = sandbox.execute("import subprocess", ExecutionMode::Safe).await;
    assert!(!blocked.success);
    assert_eq!(
        blocked.error.as_deref(),
        Some("Code validation failed: Prohibited import: subprocess")
    );

    let first = sandbox.execute("x = 42", ExecutionMode::Persistent).await;
    assert!(first.success);
    let second = sandbox.execute("y = x * 2\nprint(y)", ExecutionMode::Persistent).await;
    assert_eq!(second.output, "84\n");

    let json = serde_json::to_value(&second).unwrap();
    assert_eq!(json["variables"]["y"], serde_json::json!(84));
    assert_eq!(json["session_variables"]["x"], serde_json::json!(42));
}
