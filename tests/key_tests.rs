use powertools_idempotency::{IdempotencyConfig, IdempotencyError};

#[test]
fn test_key_generation_consistency() {
    let config = IdempotencyConfig::default().with_key_prefix("payments");
    let payload = serde_json::json!({
        "source_account": "550e8400-e29b-41d4-a716-446655440000",
        "destination_account": "550e8400-e29b-41d4-a716-446655440001",
        "amount": "100.00",
        "currency": "USD"
    });

    let key1 = config.idempotency_key(&payload).unwrap();
    let key2 = config.idempotency_key(&payload).unwrap();

    assert_eq!(key1, key2, "Same payload should produce same key");
    assert!(key1.starts_with("payments#"));
}

#[test]
fn test_key_length() {
    let config = IdempotencyConfig::default();
    let key = config.idempotency_key(&serde_json::json!({"a": 1})).unwrap();

    // SHA-256 produces 64 hex chars after the prefix and separator.
    let digest = key.split_once('#').unwrap().1;
    assert_eq!(digest.len(), 64);
}

#[test]
fn test_different_payloads_produce_different_keys() {
    let config = IdempotencyConfig::default();

    let key1 = config
        .idempotency_key(&serde_json::json!({"amount": "100.00"}))
        .unwrap();
    let key2 = config
        .idempotency_key(&serde_json::json!({"amount": "200.00"}))
        .unwrap();

    assert_ne!(key1, key2, "Different amounts should produce different keys");
}

#[test]
fn test_extractor_scopes_key_to_selected_field() {
    let config = IdempotencyConfig::default()
        .with_event_key_extractor(|payload| payload.get("request_token").cloned());

    let key1 = config
        .idempotency_key(&serde_json::json!({"request_token": "t-1", "retry": 1}))
        .unwrap();
    let key2 = config
        .idempotency_key(&serde_json::json!({"request_token": "t-1", "retry": 2}))
        .unwrap();
    let key3 = config
        .idempotency_key(&serde_json::json!({"request_token": "t-2", "retry": 1}))
        .unwrap();

    assert_eq!(key1, key2);
    assert_ne!(key1, key3);
}

#[test]
fn test_required_key_enforcement() {
    let config = IdempotencyConfig::default()
        .with_event_key_extractor(|payload| payload.get("request_token").cloned())
        .with_throw_on_no_idempotency_key(true);

    let err = config
        .idempotency_key(&serde_json::json!({"no_token": true}))
        .unwrap_err();

    assert!(matches!(err, IdempotencyError::Configuration(_)));
}

#[test]
fn test_null_extraction_counts_as_no_match() {
    let config = IdempotencyConfig::default()
        .with_event_key_extractor(|payload| payload.get("request_token").cloned())
        .with_throw_on_no_idempotency_key(true);

    let err = config
        .idempotency_key(&serde_json::json!({"request_token": null}))
        .unwrap_err();

    assert!(matches!(err, IdempotencyError::Configuration(_)));
}

#[test]
fn test_prefix_isolates_key_spaces() {
    let payload = serde_json::json!({"order_id": "o-1"});

    let payments = IdempotencyConfig::default()
        .with_key_prefix("payments")
        .idempotency_key(&payload)
        .unwrap();
    let refunds = IdempotencyConfig::default()
        .with_key_prefix("refunds")
        .idempotency_key(&payload)
        .unwrap();

    assert_ne!(payments, refunds);
    let (_, payments_digest) = payments.split_once('#').unwrap();
    let (_, refunds_digest) = refunds.split_once('#').unwrap();
    assert_ne!(payments_digest, refunds_digest, "digest covers the prefix too");
}
