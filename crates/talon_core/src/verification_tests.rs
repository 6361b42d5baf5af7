//! End-to-end verification of the client layer's core guarantees:
//! - Rejected credentials are never retried; 5xx retries stop at the attempt cap
//! - Row decoding does not depend on how subprocess output is chunked
//! - All supported timestamp encodings decode to the same instant
//! - The event stream never jumps from connected to failed
//! - mTLS identities are cached across calls
//! - Retry scenario with a bearer token
//! - Event dispatch into typed channels and the activity feed
//! - A server-generated config with an RSA key activates mutual TLS
//! - Failed certificate extraction leaves the credential store untouched

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{SecondsFormat, TimeZone, Utc};
    use futures_util::{SinkExt, StreamExt};
    use proptest::prelude::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::config::{BridgeConfig, DispatcherConfig, StreamConfig};
    use crate::error::TalonError;
    use crate::models::timestamp::parse_timestamp;
    use crate::models::{AuthMethod, Endpoint, HuntProgress, RowDecoder, ServerInfo, StreamState};
    use crate::services::credentials::SessionCredentialsProvider;
    use crate::services::{
        extract_certificates, CredentialStore, EventStreamClient, LineBuffer, RequestDispatcher,
        SubprocessBridge,
    };

    const WAIT: Duration = Duration::from_secs(5);

    fn session_store() -> Arc<CredentialStore> {
        Arc::new(CredentialStore::with_provider(Box::new(SessionCredentialsProvider::new())))
    }

    fn dispatcher(store: &Arc<CredentialStore>, max_attempts: u32) -> RequestDispatcher {
        let config = DispatcherConfig { max_attempts, base_backoff_ms: 5, ..Default::default() };
        RequestDispatcher::new(Arc::clone(store), config)
    }

    fn fixture(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
    }

    // =========================================================================
    // Retry policy
    // =========================================================================

    #[tokio::test]
    async fn test_auth_rejections_are_never_retried() {
        for status in [401u16, 403] {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(status))
                .expect(1)
                .mount(&server)
                .await;

            let store = session_store();
            store.configure(&server.uri(), AuthMethod::api_key("tok-1")).unwrap();
            let err = dispatcher(&store, 5).server_info().await.unwrap_err();
            assert!(err.is_auth_rejection(), "status {status} gave {err:?}");
        }
    }

    #[tokio::test]
    async fn test_server_errors_retry_up_to_cap() {
        for max_attempts in [1u32, 2, 4] {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(500))
                .expect(u64::from(max_attempts))
                .mount(&server)
                .await;

            let store = session_store();
            store.configure(&server.uri(), AuthMethod::api_key("tok-1")).unwrap();
            let err = dispatcher(&store, max_attempts).server_info().await.unwrap_err();
            assert!(matches!(err, TalonError::Server { code: 500, .. }));
        }
    }

    #[test]
    fn test_backoff_is_monotonic() {
        let dispatcher = dispatcher(&session_store(), 10);
        let delays: Vec<Duration> = (0..10).map(|n| dispatcher.backoff_delay(n)).collect();
        assert!(delays.windows(2).all(|pair| pair[1] >= pair[0]));
    }

    // =========================================================================
    // Chunk-split invariance
    // =========================================================================

    fn decode(chunks: &[&[u8]]) -> Vec<crate::models::StreamingRow> {
        let mut lines = LineBuffer::new();
        let mut decoder = RowDecoder::new();
        let mut rows = Vec::new();
        for chunk in chunks {
            for line in lines.push(chunk) {
                rows.extend(decoder.decode_line(&line));
            }
        }
        rows.extend(lines.finish().and_then(|line| decoder.decode_line(&line)));
        rows.push(decoder.finish());
        rows
    }

    fn output_strategy() -> impl Strategy<Value = String> {
        let row = (any::<i64>(), "[a-zA-Z0-9 äöü€]{0,12}", proptest::option::of(any::<bool>()))
            .prop_map(|(pid, name, flag)| {
                let mut object = serde_json::json!({ "Pid": pid, "Name": name });
                if let Some(flag) = flag {
                    object["Flag"] = serde_json::Value::Bool(flag);
                }
                object.to_string()
            });
        proptest::collection::vec(row, 0..20).prop_map(|rows| rows.join("\n"))
    }

    proptest! {
        #[test]
        fn prop_chunking_is_invisible(
            output in output_strategy(),
            cuts in proptest::collection::vec(any::<usize>(), 0..16),
        ) {
            let bytes = output.as_bytes();
            let mut cuts: Vec<usize> = cuts.into_iter().map(|c| c % (bytes.len() + 1)).collect();
            cuts.sort_unstable();

            let mut chunks = Vec::new();
            let mut start = 0;
            for cut in cuts {
                chunks.push(&bytes[start..cut]);
                start = cut;
            }
            chunks.push(&bytes[start..]);

            prop_assert_eq!(decode(&chunks), decode(&[bytes]));
        }

        // =====================================================================
        // Timestamp encodings
        // =====================================================================

        #[test]
        fn prop_timestamp_encodings_agree(secs in 1_000_000_000i64..4_000_000_000, millis in 0u32..1000) {
            let known = Utc.timestamp_opt(secs, millis * 1_000_000).single().unwrap();
            let encodings = [
                serde_json::json!(secs),
                serde_json::json!(known.timestamp_nanos_opt().unwrap()),
                serde_json::json!(known.to_rfc3339_opts(SecondsFormat::Secs, true)),
                serde_json::json!(known.to_rfc3339_opts(SecondsFormat::Millis, true)),
            ];

            for encoded in encodings {
                let decoded = parse_timestamp(&encoded).unwrap();
                prop_assert!((decoded - known).num_milliseconds().abs() <= 1000, "{} decoded to {}", encoded, decoded);
            }
        }
    }

    // =========================================================================
    // Event stream state machine
    // =========================================================================

    #[tokio::test]
    async fn test_stream_never_jumps_from_connected_to_failed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            // Later reconnects are refused
            drop(listener);
            let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(ws);
        });

        let store = session_store();
        store.configure(&url, AuthMethod::api_key("tok-1")).unwrap();
        let config = StreamConfig { max_reconnect_attempts: 4, reconnect_base_ms: 5, ..Default::default() };
        let client = EventStreamClient::new(store, config);
        let mut states = client.subscribe_state();

        client.connect().await.unwrap();
        let mut seen = Vec::new();
        loop {
            let state = tokio::time::timeout(WAIT, states.recv()).await.unwrap().unwrap();
            let failed = state.is_failed();
            seen.push(state);
            if failed {
                break;
            }
        }

        for pair in seen.windows(2) {
            assert!(
                !(pair[0].is_connected() && pair[1].is_failed()),
                "connected went straight to failed: {seen:?}"
            );
            if let (StreamState::Reconnecting { attempt: a }, StreamState::Reconnecting { attempt: b }) =
                (&pair[0], &pair[1])
            {
                assert_eq!(*b, a + 1);
            }
            if pair[1].is_connected() {
                assert_eq!(pair[1].attempt(), 0);
            }
        }
        assert_eq!(seen[seen.len() - 2], StreamState::Reconnecting { attempt: 4 });
    }

    // =========================================================================
    // Identity caching
    // =========================================================================

    #[test]
    fn test_mtls_identity_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("client.crt");
        let key = dir.path().join("client.key");
        std::fs::copy(fixture("client.crt"), &cert).unwrap();
        std::fs::copy(fixture("client.key"), &key).unwrap();

        let store = session_store();
        store
            .configure("https://dfir.example.com:8889", AuthMethod::mutual_tls(&cert, &key))
            .unwrap();

        let first = store.materialize_identity().unwrap();
        std::fs::remove_file(&cert).unwrap();
        std::fs::remove_file(&key).unwrap();
        let second = store.materialize_identity().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(second.reqwest_identity().is_ok());
    }

    // =========================================================================
    // Scenarios
    // =========================================================================

    #[tokio::test]
    async fn test_scenario_two_failures_then_success() {
        let server = MockServer::start().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        Mock::given(method("GET"))
            .and(path("/api/v1/GetServerInfo"))
            .and(header("authorization", "Bearer tok-1"))
            .respond_with(move |_: &wiremock::Request| {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    ResponseTemplate::new(500)
                } else {
                    ResponseTemplate::new(200).set_body_json(serde_json::json!({"version": "1.0"}))
                }
            })
            .mount(&server)
            .await;

        let store = session_store();
        store.configure(&server.uri(), AuthMethod::api_key("tok-1")).unwrap();
        let info: ServerInfo = dispatcher(&store, 3).execute(&Endpoint::ServerInfo).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(info.version, "1.0");
    }

    #[tokio::test]
    async fn test_scenario_hunt_progress_event() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            ws.send(Message::Text(
                r#"{"type":"hunt_progress","payload":{"hunt_id":"H.1","progress":0.5}}"#.to_string(),
            ))
            .await
            .unwrap();
            while ws.next().await.is_some() {}
        });

        let store = session_store();
        store.configure(&url, AuthMethod::api_key("tok-1")).unwrap();
        let client = EventStreamClient::new(store, StreamConfig::default());
        let mut progress = client.subscribe_hunt_progress();
        assert!(client.recent_activity().is_empty());

        client.connect().await.unwrap();
        let event = tokio::time::timeout(WAIT, progress.recv()).await.unwrap().unwrap();

        assert_eq!(event, HuntProgress { hunt_id: "H.1".to_string(), progress: 0.5 });
        let recent = client.recent_activity();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].kind, "hunt_progress");
        client.disconnect().await;
    }

    #[test]
    fn test_scenario_server_generated_config_activates_mtls() {
        let store = session_store();
        let bridge = SubprocessBridge::new(BridgeConfig::default());

        let bundle = extract_certificates(&fixture("api_client_rsa.yaml")).unwrap();
        let credentials =
            bridge.activate_bundle(&store, "https://127.0.0.1:8001", &bundle).unwrap();

        assert_eq!(credentials.method.kind(), "mtls");
        let identity = store.materialize_identity().unwrap();
        assert!(identity.reqwest_identity().is_ok());
    }

    #[test]
    fn test_scenario_missing_ca_leaves_store_untouched() {
        let store = session_store();
        store.configure("https://dfir.example.com:8889", AuthMethod::api_key("tok-1")).unwrap();
        let before = store.current_credentials();
        let generation = store.generation();

        let err = extract_certificates(&fixture("api_client_missing_ca.yaml")).unwrap_err();

        assert!(matches!(err, TalonError::CertificateExtractionFailed { .. }));
        assert_eq!(store.current_credentials(), before);
        assert_eq!(store.generation(), generation);
    }
}
