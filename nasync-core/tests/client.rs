use futures_util::StreamExt;
use nasync_core::{ApiErrorClass, EntryType, NasClient, NasError};
use serde_json::json;
use wiremock::matchers::{body_bytes, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn ping_sends_bearer_token() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/v1/ping"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let client = NasClient::new(&server.uri(), "test-token").unwrap();
    client.ping().await.unwrap();
}

#[tokio::test]
async fn list_all_follows_pagination() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/v1/files/list"))
        .and(query_param("path", "/Photos"))
        .and(query_param("recursive", "true"))
        .and(query_param("offset", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                {
                    "path": "/Photos/a.jpg",
                    "name": "a.jpg",
                    "type": "file",
                    "size": 10,
                    "modified": "2024-01-01T00:00:00Z"
                }
            ],
            "limit": 500,
            "offset": 0,
            "total": 2
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/v1/files/list"))
        .and(query_param("path", "/Photos"))
        .and(query_param("offset", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                {
                    "path": "/Photos/2024",
                    "name": "2024",
                    "type": "dir"
                }
            ],
            "limit": 500,
            "offset": 1,
            "total": 2
        })))
        .mount(&server)
        .await;

    let client = NasClient::new(&server.uri(), "test-token").unwrap();
    let items = client.list_all("/Photos", true).await.unwrap();

    assert_eq!(items.len(), 2);
    assert_eq!(items[0].entry_type, EntryType::File);
    assert_eq!(items[0].size, Some(10));
    assert_eq!(items[1].entry_type, EntryType::Dir);
    assert_eq!(items[1].modified, None);
}

#[tokio::test]
async fn upload_sends_body_with_modified_time() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/api/v1/files/content"))
        .and(query_param("path", "/Docs/Hello World.txt"))
        .and(query_param("overwrite", "true"))
        .and(query_param("modified", "2024-01-01T00:00:00Z"))
        .and(body_bytes(b"payload"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let client = NasClient::new(&server.uri(), "test-token").unwrap();
    client
        .upload(
            "/Docs/Hello World.txt",
            b"payload".to_vec(),
            Some("2024-01-01T00:00:00Z"),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn download_streams_body() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/v1/files/content"))
        .and(query_param("path", "/Docs/A.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello"))
        .mount(&server)
        .await;

    let client = NasClient::new(&server.uri(), "test-token").unwrap();
    let mut stream = Box::pin(client.download("/Docs/A.txt").await.unwrap());
    let mut body = Vec::new();
    while let Some(chunk) = stream.next().await {
        body.extend_from_slice(&chunk.unwrap());
    }

    assert_eq!(body, b"hello");
}

#[tokio::test]
async fn move_resource_passes_source_and_target() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/files/move"))
        .and(query_param("from", "/Docs/c.txt"))
        .and(query_param("path", "/Docs/d.txt"))
        .and(query_param("overwrite", "false"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let client = NasClient::new(&server.uri(), "test-token").unwrap();
    client
        .move_resource("/Docs/c.txt", "/Docs/d.txt", false)
        .await
        .unwrap();
}

#[tokio::test]
async fn delete_missing_file_is_classified_not_found() {
    let server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/api/v1/files"))
        .and(query_param("path", "/Docs/gone.txt"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such file"))
        .mount(&server)
        .await;

    let client = NasClient::new(&server.uri(), "test-token").unwrap();
    let err = client.delete("/Docs/gone.txt").await.unwrap_err();

    assert_eq!(err.classification(), ApiErrorClass::NotFound);
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn rate_limit_carries_retry_after() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/v1/files/list"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "12"))
        .mount(&server)
        .await;

    let client = NasClient::new(&server.uri(), "test-token").unwrap();
    let err = client.list_all("/", true).await.unwrap_err();

    assert!(matches!(err, NasError::Api { .. }));
    assert_eq!(err.classification(), ApiErrorClass::RateLimit);
    assert!(err.is_retryable());
    assert_eq!(err.retry_after_secs(), Some(12));
}
