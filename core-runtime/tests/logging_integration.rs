//! Integration tests for logging and the event bus

use bridge_traits::time::LogLevel;
use core_runtime::events::{CoreEvent, EventBus, EventStream, NodeEvent, SessionEvent};
use core_runtime::logging::{init_logging, redact_url, LogFormat, LoggingConfig};

#[test]
fn test_logging_initializes_once() {
    let config = LoggingConfig::default()
        .with_format(LogFormat::Compact)
        .with_level(LogLevel::Warn);

    // Other tests in this binary never install a global subscriber.
    init_logging(config.clone()).unwrap();

    let second = init_logging(config);
    assert!(matches!(
        second,
        Err(core_runtime::Error::AlreadyInitialized(_))
    ));
}

#[test]
fn test_config_chaining() {
    let config = LoggingConfig::default()
        .with_format(LogFormat::Json)
        .with_level(LogLevel::Debug)
        .with_spans(false)
        .with_target(false)
        .with_thread_info(true);

    assert_eq!(config.format, LogFormat::Json);
    assert_eq!(config.level, LogLevel::Debug);
    assert!(!config.enable_spans);
    assert!(!config.display_target);
    assert!(config.display_thread_info);
}

#[test]
fn test_redact_url_keeps_path() {
    assert_eq!(
        redact_url("https://media.example.org/stream/42.opus?token=abc"),
        "https://media.example.org/stream/42.opus?[REDACTED]"
    );
    assert_eq!(redact_url(""), "");
}

#[tokio::test]
async fn test_failover_event_sequence() {
    let bus = EventBus::default();
    let mut sessions = EventStream::new(bus.subscribe())
        .filter(|event| matches!(event, CoreEvent::Session(_)));

    bus.emit(CoreEvent::Session(SessionEvent::Started {
        session_id: 1,
        node: "a:1".into(),
    }))
    .ok();
    bus.emit(CoreEvent::Node(NodeEvent::WentOffline {
        address: "a:1".into(),
        failed_attempts: 1,
    }))
    .ok();
    bus.emit(CoreEvent::Session(SessionEvent::Abandoned {
        session_id: 1,
        node: "a:1".into(),
    }))
    .ok();
    bus.emit(CoreEvent::Session(SessionEvent::Adopted {
        session_id: 1,
        node: "b:1".into(),
    }))
    .ok();

    let mut seen = Vec::new();
    for _ in 0..3 {
        match sessions.recv().await.unwrap() {
            CoreEvent::Session(event) => seen.push(event),
            other => panic!("unexpected event {other:?}"),
        }
    }

    assert!(matches!(seen[0], SessionEvent::Started { .. }));
    assert!(matches!(seen[1], SessionEvent::Abandoned { .. }));
    assert!(matches!(seen[2], SessionEvent::Adopted { ref node, .. } if node == "b:1"));
    assert!(seen.iter().all(|event| event.session_id() == 1));
}
