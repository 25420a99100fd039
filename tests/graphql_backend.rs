//! HTTP-level tests for [`GraphqlBackend`] against a mock GraphQL/object-store
//! server, exercising the wire format rather than the in-memory mock.

use artifact_upload::backend::{ArtifactState, Backend, GraphqlBackend};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn create_artifact_parses_pending_state_from_graphql_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": {
                "createArtifact": {
                    "artifact": { "id": "artifact-1", "state": "PENDING" },
                    "latestArtifact": null
                }
            }
        })))
        .mount(&server)
        .await;

    let backend = GraphqlBackend::new(reqwest::Client::new(), format!("{}/graphql", server.uri()), "test-token");
    let created = backend
        .create_artifact("dataset", "my-artifact", "digest123", "client-1", "sequence-1")
        .await
        .unwrap();

    assert_eq!(created.artifact_id, "artifact-1");
    assert_eq!(created.state, ArtifactState::Pending);
    assert!(created.latest_id.is_none());
}

#[tokio::test]
async fn create_artifact_surfaces_graphql_errors_as_protocol_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "errors": [{ "message": "artifact name already exists" }]
        })))
        .mount(&server)
        .await;

    let backend = GraphqlBackend::new(reqwest::Client::new(), format!("{}/graphql", server.uri()), "test-token");
    let result = backend
        .create_artifact("dataset", "dup-artifact", "digest123", "client-1", "sequence-1")
        .await;

    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("GraphQL error"));
}

#[tokio::test]
async fn put_object_treats_403_as_expired_url() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/upload/object"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let backend = GraphqlBackend::new(reqwest::Client::new(), format!("{}/graphql", server.uri()), "test-token");
    let url = format!("{}/upload/object", server.uri());
    let result = backend.put_object(&url, &[], bytes::Bytes::from_static(b"payload")).await;

    assert!(matches!(result, Err(artifact_upload::ArtifactError::UrlExpired(_))));
}

#[tokio::test]
async fn put_object_returns_etag_on_success() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/upload/object"))
        .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"abc123\""))
        .mount(&server)
        .await;

    let backend = GraphqlBackend::new(reqwest::Client::new(), format!("{}/graphql", server.uri()), "test-token");
    let url = format!("{}/upload/object", server.uri());
    let etag = backend
        .put_object(&url, &[], bytes::Bytes::from_static(b"payload"))
        .await
        .unwrap();

    assert_eq!(etag, "abc123");
}
