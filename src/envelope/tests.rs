use super::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct MeterReading {
    device_id: String,
    kwh: f64,
    tags: Vec<String>,
}

fn reading() -> MeterReading {
    MeterReading {
        device_id: "meter-7".to_string(),
        kwh: 12.5,
        tags: vec!["north".to_string()],
    }
}

#[test]
fn test_envelope_wire_field_names() {
    let envelope = EventEnvelope::with_timestamp("t", "e", 42, reading());
    let value: serde_json::Value = serde_json::from_slice(&envelope.to_bytes().unwrap()).unwrap();

    assert_eq!(value["topic"], "t");
    assert_eq!(value["eventType"], "e");
    assert_eq!(value["timestamp"], 42);
    assert_eq!(value["payload"]["device_id"], "meter-7");
}

#[test]
fn test_new_stamps_current_time() {
    let before = chrono::Utc::now().timestamp_millis();
    let envelope = EventEnvelope::new("t", "e", 1u8);
    let after = chrono::Utc::now().timestamp_millis();

    assert!(envelope.timestamp >= before && envelope.timestamp <= after);
}

#[test]
fn test_header_round_trip_to_typed_payload() {
    let bytes = EventEnvelope::with_timestamp("t", "e", 1_700_000_000_123, reading())
        .to_bytes()
        .unwrap();

    let header = EventHeader::parse(&bytes).unwrap();
    assert_eq!(header.topic, "t");
    assert_eq!(header.event_type, "e");
    assert_eq!(header.timestamp, 1_700_000_000_123);

    let payload: MeterReading = header.payload().unwrap();
    assert_eq!(payload, reading());
}

#[test]
fn test_header_decode_rebuilds_envelope() {
    let original = EventEnvelope::with_timestamp("orders", "OrderPlaced", 7, vec![1, 2, 3]);
    let header = EventHeader::parse(&original.to_bytes().unwrap()).unwrap();

    let decoded: EventEnvelope<Vec<i32>> = header.decode().unwrap();
    assert_eq!(decoded, original);
}

#[test]
fn test_absent_payload_reports_no_payload() {
    let header = EventHeader::parse(br#"{"topic":"t","eventType":"e","timestamp":1}"#).unwrap();

    assert!(!header.has_payload());
    assert!(matches!(
        header.payload::<MeterReading>(),
        Err(EnvelopeError::NoPayload)
    ));
}

#[test]
fn test_null_payload_reports_no_payload() {
    let header =
        EventHeader::parse(br#"{"topic":"t","eventType":"e","timestamp":1,"payload":null}"#)
            .unwrap();

    assert!(matches!(
        header.payload::<MeterReading>(),
        Err(EnvelopeError::NoPayload)
    ));
}

#[test]
fn test_wrong_payload_shape_is_a_decode_error() {
    let header =
        EventHeader::parse(br#"{"topic":"t","eventType":"e","timestamp":1,"payload":[1,2]}"#)
            .unwrap();

    match header.payload::<MeterReading>() {
        Err(EnvelopeError::Payload { type_name, .. }) => {
            assert!(type_name.contains("MeterReading"));
        }
        other => panic!("Expected Payload error, got {:?}", other),
    }
}

#[test]
fn test_raw_payload_is_preserved_verbatim() {
    let header = EventHeader::parse(
        br#"{"topic":"t","eventType":"e","timestamp":1,"payload":{"b":2,"a":1}}"#,
    )
    .unwrap();

    assert_eq!(header.raw_payload(), Some(r#"{"b":2,"a":1}"#));
}

#[test]
fn test_header_fields_are_lenient() {
    let header = EventHeader::parse(br#"{"payload":5}"#).unwrap();

    assert_eq!(header.topic, "");
    assert_eq!(header.event_type, "");
    assert_eq!(header.timestamp, 0);
    assert_eq!(header.payload::<u32>().unwrap(), 5);
}

#[test]
fn test_malformed_body_fails_header_parse() {
    assert!(matches!(
        EventHeader::parse(b"not json at all"),
        Err(EnvelopeError::Header(_))
    ));
    assert!(matches!(
        EventHeader::parse(br#"{"topic": 17}"#),
        Err(EnvelopeError::Header(_))
    ));
}

#[test]
fn test_raw_json_includes_payload() {
    let header =
        EventHeader::parse(br#"{"topic":"t","eventType":"e","timestamp":3,"payload":{"x":1}}"#)
            .unwrap();
    let json: serde_json::Value = serde_json::from_str(&header.raw_json().unwrap()).unwrap();

    assert_eq!(json["eventType"], "e");
    assert_eq!(json["payload"]["x"], 1);
}

#[test]
fn test_to_json_string_matches_bytes() {
    let envelope = EventEnvelope::with_timestamp("t", "e", 9, "hello");
    assert_eq!(
        envelope.to_json_string().unwrap().as_bytes(),
        envelope.to_bytes().unwrap().as_slice()
    );
}
