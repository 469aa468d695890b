fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::num::NonZeroU64;
    use std::path::PathBuf;

    use klb_upload_protocol::messages::NegotiationData;
    use klb_upload_protocol::{
        ApiEnvelope, CompletionData, NegotiateRequest, NegotiationResult, SignV4Request,
        SignV4Response, UploadRequest,
    };

    /// Returns the path to the fixtures directory.
    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    /// Loads a fixture JSON file and returns it as a `serde_json::Value`.
    fn load_fixture(name: &str) -> serde_json::Value {
        let path = fixtures_dir().join(name);
        let data = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()));
        serde_json::from_str(&data)
            .unwrap_or_else(|e| panic!("failed to parse fixture {}: {e}", path.display()))
    }

    /// Normalizes numbers so that `65` and `65.0` compare as equal.
    fn normalize_value(v: &serde_json::Value) -> serde_json::Value {
        match v {
            serde_json::Value::Number(n) => match n.as_f64() {
                Some(f) => serde_json::json!(f),
                None => v.clone(),
            },
            serde_json::Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), normalize_value(v)))
                    .collect(),
            ),
            serde_json::Value::Array(arr) => {
                serde_json::Value::Array(arr.iter().map(normalize_value).collect())
            }
            _ => v.clone(),
        }
    }

    /// Deserializes a fixture into a Rust type, re-serializes it, and compares
    /// the JSON values (order-independent, float-normalized comparison).
    fn roundtrip_test<T>(name: &str) -> T
    where
        T: serde::de::DeserializeOwned + serde::Serialize,
    {
        let fixture = load_fixture(name);
        let parsed: T = serde_json::from_value(fixture.clone())
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"));
        let reserialized = serde_json::to_value(&parsed)
            .unwrap_or_else(|e| panic!("failed to re-serialize {name}: {e}"));

        assert_eq!(
            normalize_value(&fixture),
            normalize_value(&reserialized),
            "roundtrip mismatch for {name}:\n  wire: {fixture}\n  Rust: {reserialized}"
        );
        parsed
    }

    fn envelope_data<T: serde::de::DeserializeOwned>(name: &str) -> T {
        let envelope = roundtrip_test::<ApiEnvelope>(name);
        assert!(envelope.is_success(), "{name} is not a success envelope");
        envelope
            .parse_data()
            .unwrap_or_else(|e| panic!("failed to decode data of {name}: {e}"))
    }

    #[test]
    fn fixture_negotiate_request() {
        let parsed = roundtrip_test::<NegotiateRequest>("negotiate_request.json");
        assert_eq!(parsed.mime_type, "video/mp4");
        assert_eq!(parsed.params.len(), 2);
    }

    #[test]
    fn negotiate_request_from_upload_request_matches_fixture() {
        let fixture = load_fixture("negotiate_request.json");
        let last_modified = chrono::DateTime::from_timestamp_millis(1_714_564_800_000).unwrap();
        let request = UploadRequest::new("holiday.mp4", 734_003_200, "video/mp4")
            .with_last_modified(last_modified)
            .with_param("album", "al-2024")
            .with_param("public", false);
        let body = serde_json::to_value(NegotiateRequest::from(&request)).unwrap();
        assert_eq!(body, fixture);
    }

    #[test]
    fn fixture_negotiation_direct_put() {
        let data: NegotiationData = envelope_data("negotiation_direct_put.json");
        assert!(data.other.contains_key("Expires"));
        match data.classify().unwrap() {
            NegotiationResult::DirectPut {
                put_url,
                complete_endpoint,
                block_size,
            } => {
                assert!(put_url.starts_with("https://upload.example.com/put/"));
                assert_eq!(complete_endpoint, "Drive/Upload/upl-1:complete");
                assert_eq!(block_size, NonZeroU64::new(5_242_880));
            }
            other => panic!("expected direct PUT, got {other:?}"),
        }
    }

    #[test]
    fn fixture_negotiation_s3() {
        let data: NegotiationData = envelope_data("negotiation_s3.json");
        match data.classify().unwrap() {
            NegotiationResult::S3Multipart {
                upload_session_id,
                bucket_host,
                bucket_name,
                region,
                object_key,
            } => {
                assert_eq!(upload_session_id, "clabu-7vy3ei-ogtf-ehxd-3ytc-fuctxrc4");
                assert_eq!(bucket_host, "s3.ap-northeast-1.amazonaws.com");
                assert_eq!(bucket_name, "klb-uploads");
                assert_eq!(region, "ap-northeast-1");
                assert_eq!(object_key, "upload/clabu-7vy3ei/holiday.mp4");
            }
            other => panic!("expected S3 multipart, got {other:?}"),
        }
    }

    #[test]
    fn fixture_error_envelope() {
        let envelope = roundtrip_test::<ApiEnvelope>("error_envelope.json");
        assert!(!envelope.is_success());
        assert_eq!(envelope.error_message(), "Upload session expired");
        assert_eq!(envelope.token.as_deref(), Some("error_upload_expired"));
    }

    #[test]
    fn fixture_sign_v4_request() {
        let parsed = roundtrip_test::<SignV4Request>("sign_v4_request.json");
        assert_eq!(parsed.headers.len(), 3);
        assert_eq!(parsed.hash, parsed.headers["x-amz-content-sha256"]);
    }

    #[test]
    fn fixture_sign_v4_response() {
        let parsed: SignV4Response = envelope_data("sign_v4_response.json");
        assert!(
            parsed
                .authorization
                .unwrap()
                .starts_with("AWS4-HMAC-SHA256 ")
        );
    }

    #[test]
    fn fixture_completion() {
        let parsed = roundtrip_test::<CompletionData>("completion.json");
        let result = parsed.into_result("application/octet-stream").unwrap();
        assert_eq!(result.blob_id, "blob-4n5pxq-ylnb-d5fd-uuey-ulk4ab4q");
        assert_eq!(result.size_bytes, 734_003_200);
        assert_eq!(result.mime_type, "video/mp4");
        assert!(result.sha256.is_some());
        assert!(result.extra.contains_key("Created"));
    }
}
