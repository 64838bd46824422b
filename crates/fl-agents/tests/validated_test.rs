use fl_agents::engine::EngineError;
use fl_agents::validated::generate_validated;
use fl_harness::provider::{Message, Purpose, ScriptedProvider};

const VALID: &str = r#"{"tool": "build", "arguments": {"path": "/tmp/p"}}"#;

fn prompt() -> Vec<Message> {
    vec![Message::system("tools only"), Message::user("build it")]
}

#[tokio::test]
async fn succeeds_on_fifth_attempt_after_four_bad_replies() {
    let provider = ScriptedProvider::new([
        "Sure, I'll build it.",
        r#"{"tool": "", "arguments": {}}"#,
        r#"{"tool": "build"}"#,
        r#"{"tool": "build", "arguments": {"#,
        VALID,
    ]);

    let out = generate_validated(&provider, Purpose::Code, &prompt(), 5)
        .await
        .unwrap();

    assert_eq!(out.attempts, 5);
    assert_eq!(out.call.tool, "build");
    assert_eq!(out.raw, VALID);
    // Each failure adds the rejected reply and a correction.
    assert_eq!(provider.calls()[4].len(), 2 + 4 * 2);
}

#[tokio::test]
async fn five_bad_replies_exhaust_attempts() {
    let provider = ScriptedProvider::new(["no"; 5]);

    let err = generate_validated(&provider, Purpose::Code, &prompt(), 5)
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::AttemptsExhausted(5)));
    assert_eq!(err.to_string(), "no valid tool call after 5 attempts");
    assert_eq!(provider.call_count(), 5);
}

#[tokio::test]
async fn provider_errors_are_not_retried() {
    let provider = ScriptedProvider::new(Vec::<String>::new());

    let err = generate_validated(&provider, Purpose::Code, &prompt(), 5)
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Provider(_)));
    assert_eq!(provider.call_count(), 1);
}

#[tokio::test]
async fn first_valid_reply_needs_no_correction() {
    let provider = ScriptedProvider::new([VALID]);
    let out = generate_validated(&provider, Purpose::Code, &prompt(), 5)
        .await
        .unwrap();
    assert_eq!(out.attempts, 1);
    assert_eq!(provider.calls()[0], prompt());
}
