//! Round trips against a real endpoint. The target must accept
//! `POST {"action", "data"}` and answer with the `{success, data, error}`
//! envelope that [`keel::HttpTransport`] speaks.

use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use serde_json::json;

use keel::{CallOptions, HttpTransport, System, SystemConfig};

use crate::should_run_live_tests;

const ENDPOINT_VAR: &str = "KEEL_LIVE_ENDPOINT";
const TOKEN_VAR: &str = "KEEL_LIVE_TOKEN";

fn live_transport() -> Option<HttpTransport> {
    let endpoint = match std::env::var(ENDPOINT_VAR) {
        Ok(endpoint) => endpoint,
        Err(_) => {
            println!("Skipping live transport test: {} not set", ENDPOINT_VAR);
            return None;
        }
    };
    let mut transport = HttpTransport::new(endpoint);
    if let Ok(token) = std::env::var(TOKEN_VAR) {
        transport = transport.with_auth_token(SecretString::from(token));
    }
    Some(transport)
}

#[tokio::test]
async fn test_live_endpoint_round_trip() {
    if !should_run_live_tests() {
        return;
    }
    let Some(transport) = live_transport() else {
        return;
    };

    let system = System::new(SystemConfig::default(), Arc::new(transport));
    let response = system
        .client()
        .call_with(
            "ping",
            json!({}),
            CallOptions::default().with_timeout(Duration::from_secs(10)),
        )
        .await;
    assert!(
        response.success,
        "live endpoint rejected ping: {:?}",
        response.error
    );
    assert!(response.duration <= Duration::from_secs(10));

    system.shutdown().await;
}
