use arbor_core::errors::{ArborError, ErrorInfo};

fn sample_info(code: &str, message: &str) -> ErrorInfo {
    ErrorInfo::new(code, message)
        .with_context("id", "kappa")
        .with_context("expected", "4")
}

#[test]
fn checkpoint_error_surface() {
    let err = ArborError::Checkpoint(sample_info("checkpoint-dimension-mismatch", "bad length"));
    assert_eq!(err.code(), "checkpoint-dimension-mismatch");
    assert!(err.info().context.contains_key("expected"));
}

#[test]
fn display_includes_context_and_hint() {
    let err = ArborError::Audit(
        sample_info("correction-budget-exceeded", "posterior drifted").with_hint("check caching"),
    );
    let rendered = err.to_string();
    assert!(rendered.starts_with("audit error: posterior drifted"));
    assert!(rendered.contains("expected=4"));
    assert!(rendered.contains("hint: check caching"));
}

#[test]
fn errors_serialize_with_family_tag() {
    let err = ArborError::Init(ErrorInfo::new("init-exhausted", "no finite start"));
    let json = serde_json::to_value(&err).unwrap();
    assert_eq!(json["family"], "Init");
    assert_eq!(json["detail"]["code"], "init-exhausted");
    let back: ArborError = serde_json::from_value(json).unwrap();
    assert_eq!(back, err);
}
