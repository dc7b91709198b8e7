//! Instance metadata lookups against a local stand-in for the metadata service.

mod common;

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use common::{start_mock_backend, start_routing_backend, test_client, MockBackend};
use downstream_http::client::aws::{
    local_hostname, AVAILABILITY_ZONE_PATH, IDENTITY_DOCUMENT_PATH, INSTANCE_ID_PATH,
    UNKNOWN_VALUE,
};
use downstream_http::client::AwsMetadata;
use downstream_http::config::CircuitBreakerConfig;

const DOCUMENT: &str = r#"{"instanceId":"i-aaa11b2c","availabilityZone":"us-west-2b","region":"us-west-2"}"#;

fn loopback() -> Vec<IpAddr> {
    vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]
}

fn breakers() -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold: 20,
        reset_timeout_ms: 60_000,
        call_timeout_ms: None,
    }
}

async fn metadata_backend() -> MockBackend {
    start_routing_backend(Ipv4Addr::LOCALHOST.into(), |request| {
        let reply = match request.path.as_str() {
            INSTANCE_ID_PATH => (200, "i-aaa11b2c\n".to_string()),
            AVAILABILITY_ZONE_PATH => (200, "us-west-2b".to_string()),
            IDENTITY_DOCUMENT_PATH => (200, DOCUMENT.to_string()),
            _ => (404, "not found".to_string()),
        };
        async move { (reply.0, reply.1, Duration::ZERO) }
    })
    .await
}

#[tokio::test]
async fn test_lookups_read_metadata_service() {
    let backend = metadata_backend().await;
    let client = test_client(&[("metadata", loopback())], breakers(), Duration::from_secs(5));
    let metadata = AwsMetadata::with_base_url(&client, backend.url("metadata", "/"));

    assert_eq!(metadata.instance_id().await, "i-aaa11b2c");
    assert_eq!(metadata.availability_zone().await, "us-west-2b");
    assert_eq!(metadata.region().await, "us-west-2");

    let mut paths: Vec<String> = backend.requests().into_iter().map(|r| r.path).collect();
    paths.sort();
    let mut expected = vec![INSTANCE_ID_PATH, AVAILABILITY_ZONE_PATH, IDENTITY_DOCUMENT_PATH];
    expected.sort();
    assert_eq!(paths, expected);
}

#[tokio::test]
async fn test_error_status_becomes_unknown() {
    let backend = start_mock_backend(500, "broken").await;
    let client = test_client(&[("metadata", loopback())], breakers(), Duration::from_secs(5));
    let metadata = AwsMetadata::with_base_url(&client, backend.url("metadata", ""));

    assert_eq!(metadata.instance_id().await, UNKNOWN_VALUE);
    assert_eq!(metadata.availability_zone().await, UNKNOWN_VALUE);
    assert_eq!(metadata.region().await, UNKNOWN_VALUE);
    assert_eq!(backend.request_count(), 3);
}

#[tokio::test]
async fn test_unreachable_service_becomes_unknown() {
    let client = test_client(&[], breakers(), Duration::from_secs(5));
    let metadata = AwsMetadata::with_base_url(&client, "http://metadata-missing:8080");

    assert_eq!(metadata.instance_id().await, UNKNOWN_VALUE);
    assert_eq!(metadata.region().await, UNKNOWN_VALUE);
}

#[tokio::test]
async fn test_app_info_uses_region_as_data_center() {
    let backend = metadata_backend().await;
    let client = test_client(&[("metadata", loopback())], breakers(), Duration::from_secs(5));
    let metadata = AwsMetadata::with_base_url(&client, backend.url("metadata", ""));

    let info = metadata.app_info("orders", "prod").await;

    assert_eq!(info.app_id, "orders");
    assert_eq!(info.environment, "prod");
    assert_eq!(info.data_center, "us-west-2");
    assert_eq!(info.instance_id, "i-aaa11b2c");
}

#[tokio::test]
async fn test_app_info_falls_back_to_host_name() {
    let backend = start_mock_backend(503, "unavailable").await;
    let client = test_client(&[("metadata", loopback())], breakers(), Duration::from_secs(5));
    let metadata = AwsMetadata::with_base_url(&client, backend.url("metadata", ""));

    let info = metadata.app_info("orders", "prod").await;

    assert_eq!(info.data_center, UNKNOWN_VALUE);
    assert_eq!(info.instance_id, local_hostname());
}

#[tokio::test]
async fn test_local_environment_skips_metadata_service() {
    let backend = metadata_backend().await;
    let client = test_client(&[("metadata", loopback())], breakers(), Duration::from_secs(5));
    let metadata = AwsMetadata::with_base_url(&client, backend.url("metadata", ""));

    let info = metadata.app_info("orders", "Local").await;

    assert_eq!(info.environment, "local");
    assert_eq!(info.data_center, "local");
    assert_eq!(backend.request_count(), 0);
}
