//! The GraphQL control-plane client and object-store HTTP leg.
//!
//! Operations are modeled as a thin, hand-rolled request layer (query
//! string + JSON variables over a POST) rather than a codegen'd client,
//! since no GraphQL schema is in scope here. [`GraphqlBackend`] is the
//! production implementation over a shared [`reqwest::Client`];
//! [`MockBackend`] is an in-memory test double playing the same role the
//! teacher's protocol tests gave to mock repository/auth services.

use crate::errors::{ArtifactError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::instrument;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactState {
    Pending,
    Committing,
    Committed,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct CreateArtifactResult {
    pub artifact_id: String,
    pub state: ArtifactState,
    pub latest_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestType {
    Full,
    Incremental,
    Patch,
}

#[derive(Debug, Clone)]
pub struct ManifestFile {
    pub upload_url: Option<String>,
    pub upload_headers: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct CreateArtifactManifestResult {
    pub manifest_id: String,
    pub file: ManifestFile,
}

#[derive(Debug, Clone)]
pub struct FileSpec {
    pub artifact_id: String,
    pub artifact_manifest_id: String,
    pub name: String,
    pub md5: String,
    pub upload_parts_input: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct PreparedFileResult {
    pub upload_url: Option<String>,
    pub upload_headers: Vec<(String, String)>,
    pub multipart_urls: Option<Vec<String>>,
    pub upload_id: Option<String>,
    pub storage_path: String,
    pub birth_artifact_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CompletedPart {
    pub part_number: u32,
    pub hex_md5: String,
}

/// One async method per GraphQL operation in the control-plane contract,
/// plus the object-store PUT legs. Implemented by [`GraphqlBackend`] in
/// production and [`MockBackend`] in tests.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn create_artifact(
        &self,
        type_: &str,
        name: &str,
        digest: &str,
        client_id: &str,
        sequence_client_id: &str,
    ) -> Result<CreateArtifactResult>;

    async fn create_artifact_manifest(
        &self,
        filename: &str,
        digest: &str,
        artifact_id: &str,
        base_artifact_id: Option<&str>,
        manifest_type: ManifestType,
        include_upload: bool,
    ) -> Result<CreateArtifactManifestResult>;

    async fn update_artifact_manifest(&self, manifest_id: &str, digest: &str) -> Result<ManifestFile>;

    async fn create_artifact_files(&self, specs: &[FileSpec]) -> Result<Vec<PreparedFileResult>>;

    async fn complete_multipart_upload_artifact(
        &self,
        artifact_id: &str,
        storage_path: &str,
        completed_parts: &[CompletedPart],
        upload_id: &str,
    ) -> Result<String>;

    async fn commit_artifact(&self, artifact_id: &str) -> Result<String>;

    async fn use_artifact(&self, artifact_id: &str, run_id: &str, entity: &str, project: &str) -> Result<()>;

    async fn put_object(&self, url: &str, headers: &[(String, String)], body: Bytes) -> Result<String>;

    async fn put_object_part(&self, url: &str, body: Bytes) -> Result<String>;
}

/// Production backend: builds `{"query": ..., "variables": ...}` bodies by
/// hand and posts them to the GraphQL endpoint over a shared client.
pub struct GraphqlBackend {
    client: reqwest::Client,
    endpoint: String,
    auth_token: String,
}

impl GraphqlBackend {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            auth_token: auth_token.into(),
        }
    }

    #[instrument(skip(self, variables), fields(operation))]
    async fn call<T: Serialize + ?Sized>(&self, query: &str, variables: &T) -> Result<Value> {
        let body = json!({ "query": query, "variables": variables });
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.auth_token)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let payload: Value = response.json().await?;
        if let Some(errors) = payload.get("errors") {
            return Err(ArtifactError::Protocol(format!("GraphQL error: {errors}")));
        }
        if !status.is_success() {
            return Err(ArtifactError::NonRetryable(self.endpoint.clone(), status.to_string()));
        }
        payload
            .get("data")
            .cloned()
            .ok_or_else(|| ArtifactError::Protocol("GraphQL response missing `data`".to_string()))
    }
}

#[async_trait]
impl Backend for GraphqlBackend {
    async fn create_artifact(
        &self,
        type_: &str,
        name: &str,
        digest: &str,
        client_id: &str,
        sequence_client_id: &str,
    ) -> Result<CreateArtifactResult> {
        let data = self
            .call(
                CREATE_ARTIFACT_QUERY,
                &json!({
                    "type": type_,
                    "name": name,
                    "digest": digest,
                    "clientID": client_id,
                    "sequenceClientID": sequence_client_id,
                }),
            )
            .await?;
        let artifact = &data["createArtifact"]["artifact"];
        let state = match artifact["state"].as_str().unwrap_or("") {
            "PENDING" => ArtifactState::Pending,
            "COMMITTING" => ArtifactState::Committing,
            "COMMITTED" => ArtifactState::Committed,
            "DELETED" => ArtifactState::Deleted,
            other => return Err(ArtifactError::Protocol(format!("unknown artifact state `{other}`"))),
        };
        Ok(CreateArtifactResult {
            artifact_id: artifact["id"].as_str().unwrap_or_default().to_string(),
            state,
            latest_id: data["createArtifact"]["latestArtifact"]["id"].as_str().map(str::to_string),
        })
    }

    async fn create_artifact_manifest(
        &self,
        filename: &str,
        digest: &str,
        artifact_id: &str,
        base_artifact_id: Option<&str>,
        manifest_type: ManifestType,
        include_upload: bool,
    ) -> Result<CreateArtifactManifestResult> {
        let type_str = match manifest_type {
            ManifestType::Full => "FULL",
            ManifestType::Incremental => "INCREMENTAL",
            ManifestType::Patch => "PATCH",
        };
        let data = self
            .call(
                CREATE_ARTIFACT_MANIFEST_QUERY,
                &json!({
                    "filename": filename,
                    "digest": digest,
                    "artifactID": artifact_id,
                    "baseArtifactID": base_artifact_id,
                    "type": type_str,
                    "includeUpload": include_upload,
                }),
            )
            .await?;
        let manifest = &data["createArtifactManifest"]["artifactManifest"];
        Ok(CreateArtifactManifestResult {
            manifest_id: manifest["id"].as_str().unwrap_or_default().to_string(),
            file: parse_manifest_file(&manifest["file"]),
        })
    }

    async fn update_artifact_manifest(&self, manifest_id: &str, digest: &str) -> Result<ManifestFile> {
        let data = self
            .call(
                UPDATE_ARTIFACT_MANIFEST_QUERY,
                &json!({ "artifactManifestID": manifest_id, "digest": digest }),
            )
            .await?;
        Ok(parse_manifest_file(&data["updateArtifactManifest"]["artifactManifest"]["file"]))
    }

    async fn create_artifact_files(&self, specs: &[FileSpec]) -> Result<Vec<PreparedFileResult>> {
        let inputs: Vec<Value> = specs
            .iter()
            .map(|spec| {
                json!({
                    "artifactID": spec.artifact_id,
                    "artifactManifestID": spec.artifact_manifest_id,
                    "name": spec.name,
                    "md5": spec.md5,
                    "uploadPartsInput": spec.upload_parts_input,
                })
            })
            .collect();
        let data = self
            .call(CREATE_ARTIFACT_FILES_QUERY, &json!({ "artifactFiles": inputs }))
            .await?;
        let edges = data["createArtifactFiles"]["files"]["edges"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        edges
            .iter()
            .map(|edge| {
                let node = &edge["node"];
                Ok(PreparedFileResult {
                    upload_url: node["uploadUrl"].as_str().map(str::to_string),
                    upload_headers: parse_headers(&node["uploadHeaders"]),
                    multipart_urls: node["uploadMultipartUrls"]["uploadUrlParts"].as_array().map(|parts| {
                        parts
                            .iter()
                            .filter_map(|p| p["uploadUrl"].as_str().map(str::to_string))
                            .collect()
                    }),
                    upload_id: node["uploadMultipartUrls"]["uploadID"].as_str().map(str::to_string),
                    storage_path: node["storagePath"].as_str().unwrap_or_default().to_string(),
                    birth_artifact_id: node["birthArtifactID"].as_str().map(str::to_string),
                })
            })
            .collect()
    }

    async fn complete_multipart_upload_artifact(
        &self,
        artifact_id: &str,
        storage_path: &str,
        completed_parts: &[CompletedPart],
        upload_id: &str,
    ) -> Result<String> {
        let parts: Vec<Value> = completed_parts
            .iter()
            .map(|p| json!({ "partNumber": p.part_number, "hexMD5": p.hex_md5 }))
            .collect();
        let data = self
            .call(
                COMPLETE_MULTIPART_UPLOAD_QUERY,
                &json!({
                    "artifactID": artifact_id,
                    "storagePath": storage_path,
                    "completedParts": parts,
                    "uploadID": upload_id,
                    "completeMultipartAction": "Complete",
                }),
            )
            .await?;
        Ok(data["completeMultipartUploadArtifact"]["digest"]
            .as_str()
            .unwrap_or_default()
            .to_string())
    }

    async fn commit_artifact(&self, artifact_id: &str) -> Result<String> {
        let data = self
            .call(COMMIT_ARTIFACT_QUERY, &json!({ "artifactID": artifact_id }))
            .await?;
        Ok(data["commitArtifact"]["artifact"]["digest"]
            .as_str()
            .unwrap_or_default()
            .to_string())
    }

    async fn use_artifact(&self, artifact_id: &str, run_id: &str, entity: &str, project: &str) -> Result<()> {
        self.call(
            USE_ARTIFACT_QUERY,
            &json!({ "artifactID": artifact_id, "runID": run_id, "entity": entity, "project": project }),
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self, body), fields(bytes = body.len()))]
    async fn put_object(&self, url: &str, headers: &[(String, String)], body: Bytes) -> Result<String> {
        let mut request = self.client.put(url).body(body);
        for (key, value) in headers {
            request = request.header(key, value);
        }
        let response = request.send().await?;
        classify_put_response(response).await
    }

    async fn put_object_part(&self, url: &str, body: Bytes) -> Result<String> {
        let response = self.client.put(url).body(body).send().await?;
        classify_put_response(response).await
    }
}

async fn classify_put_response(response: reqwest::Response) -> Result<String> {
    let status = response.status();
    if status.as_u16() == 401 || status.as_u16() == 403 {
        return Err(ArtifactError::UrlExpired(response.url().to_string()));
    }
    let etag = response
        .headers()
        .get("ETag")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim_matches('"').to_string());
    if status.as_u16() == 408 || status.as_u16() == 409 || status.as_u16() == 429 || status.is_server_error() {
        return Err(ArtifactError::Transient("object-store", status.to_string()));
    }
    let body = response.text().await.unwrap_or_default();
    if status.as_u16() == 400 && body.contains("RequestTimeout") {
        return Err(ArtifactError::Transient("object-store", "RequestTimeout".to_string()));
    }
    if !status.is_success() {
        return Err(ArtifactError::NonRetryable("object-store".to_string(), body));
    }
    etag.ok_or_else(|| ArtifactError::Protocol("object-store response missing ETag".to_string()))
}

fn parse_manifest_file(value: &Value) -> ManifestFile {
    ManifestFile {
        upload_url: value["uploadUrl"].as_str().map(str::to_string),
        upload_headers: parse_headers(&value["uploadHeaders"]),
    }
}

fn parse_headers(value: &Value) -> Vec<(String, String)> {
    value
        .as_array()
        .map(|headers| {
            headers
                .iter()
                .filter_map(|h| h.as_str())
                .filter_map(|h| h.split_once(':'))
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .collect()
        })
        .unwrap_or_default()
}

const CREATE_ARTIFACT_QUERY: &str = "mutation CreateArtifact($type: String!, $name: String!, $digest: String!, $clientID: String!, $sequenceClientID: String!) { createArtifact(input: { type: $type, name: $name, digest: $digest, clientID: $clientID, sequenceClientID: $sequenceClientID }) { artifact { id state } latestArtifact { id } } }";
const CREATE_ARTIFACT_MANIFEST_QUERY: &str = "mutation CreateArtifactManifest($filename: String!, $digest: String!, $artifactID: ID!, $baseArtifactID: ID, $type: ArtifactManifestType!, $includeUpload: Boolean!) { createArtifactManifest(input: { filename: $filename, digest: $digest, artifactID: $artifactID, baseArtifactID: $baseArtifactID, type: $type, includeUpload: $includeUpload }) { artifactManifest { id file { uploadUrl uploadHeaders } } } }";
const UPDATE_ARTIFACT_MANIFEST_QUERY: &str = "mutation UpdateArtifactManifest($artifactManifestID: ID!, $digest: String!) { updateArtifactManifest(input: { artifactManifestID: $artifactManifestID, digest: $digest }) { artifactManifest { file { uploadUrl uploadHeaders } } } }";
const CREATE_ARTIFACT_FILES_QUERY: &str = "mutation CreateArtifactFiles($artifactFiles: [CreateArtifactFileInput!]!) { createArtifactFiles(input: { artifactFiles: $artifactFiles }) { files { edges { node { uploadUrl uploadHeaders uploadMultipartUrls { uploadID uploadUrlParts { uploadUrl } } storagePath birthArtifactID } } } } }";
const COMPLETE_MULTIPART_UPLOAD_QUERY: &str = "mutation CompleteMultipartUploadArtifact($artifactID: ID!, $storagePath: String!, $completedParts: [CompletedPartInput!]!, $uploadID: String!, $completeMultipartAction: CompleteMultipartAction!) { completeMultipartUploadArtifact(input: { artifactID: $artifactID, storagePath: $storagePath, completedParts: $completedParts, uploadID: $uploadID, completeMultipartAction: $completeMultipartAction }) { digest } }";
const COMMIT_ARTIFACT_QUERY: &str = "mutation CommitArtifact($artifactID: ID!) { commitArtifact(input: { artifactID: $artifactID }) { artifact { id digest } } }";
const USE_ARTIFACT_QUERY: &str = "mutation UseArtifact($artifactID: ID!, $runID: String!, $entity: String!, $project: String!) { useArtifact(input: { artifactID: $artifactID, runID: $runID, entity: $entity, project: $project }) { artifact { id } } }";

/// In-memory test double. Every artifact starts `PENDING`; `create_artifact_files`
/// treats a save-name already seen (by md5) as a server-side dedup hit by
/// returning a null `upload_url`.
pub struct MockBackend {
    seen_digests: dashmap::DashSet<String>,
    next_id: AtomicU64,
    pub fail_next_put: std::sync::atomic::AtomicBool,
    /// One-shot: the next `put_object_part` call returns `UrlExpired` instead
    /// of succeeding, so tests can exercise the refresh-and-retry path.
    pub expire_next_part: std::sync::atomic::AtomicBool,
    /// When set, any `put_object` whose URL contains this save-name fails
    /// with `NonRetryable` every time (not one-shot), so a specific file in a
    /// multi-file artifact can be made to fail permanently regardless of
    /// which order the concurrent uploads race in.
    pub fail_save_name: std::sync::Mutex<Option<String>>,
    /// Records every `put_object` body in call order, so tests can assert
    /// upload ordering for a single save-name's queued re-uploads.
    pub put_object_log: std::sync::Mutex<Vec<Bytes>>,
    /// Counts `commit_artifact` calls, so tests can assert a commit never
    /// happened when an upload permanently failed.
    pub commit_calls: AtomicU64,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self {
            seen_digests: dashmap::DashSet::new(),
            next_id: AtomicU64::new(1),
            fail_next_put: std::sync::atomic::AtomicBool::new(false),
            expire_next_part: std::sync::atomic::AtomicBool::new(false),
            fail_save_name: std::sync::Mutex::new(None),
            put_object_log: std::sync::Mutex::new(Vec::new()),
            commit_calls: AtomicU64::new(0),
        }
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> String {
        format!("id-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn create_artifact(
        &self,
        _type_: &str,
        _name: &str,
        _digest: &str,
        _client_id: &str,
        _sequence_client_id: &str,
    ) -> Result<CreateArtifactResult> {
        Ok(CreateArtifactResult {
            artifact_id: self.next_id(),
            state: ArtifactState::Pending,
            latest_id: None,
        })
    }

    async fn create_artifact_manifest(
        &self,
        _filename: &str,
        _digest: &str,
        _artifact_id: &str,
        _base_artifact_id: Option<&str>,
        _manifest_type: ManifestType,
        include_upload: bool,
    ) -> Result<CreateArtifactManifestResult> {
        Ok(CreateArtifactManifestResult {
            manifest_id: self.next_id(),
            file: ManifestFile {
                upload_url: if include_upload { Some("https://mock/manifest".to_string()) } else { None },
                upload_headers: vec![],
            },
        })
    }

    async fn update_artifact_manifest(&self, _manifest_id: &str, _digest: &str) -> Result<ManifestFile> {
        Ok(ManifestFile {
            upload_url: Some("https://mock/manifest".to_string()),
            upload_headers: vec![],
        })
    }

    async fn create_artifact_files(&self, specs: &[FileSpec]) -> Result<Vec<PreparedFileResult>> {
        Ok(specs
            .iter()
            .map(|spec| {
                let dedup = !self.seen_digests.insert(spec.md5.clone());
                if dedup {
                    return PreparedFileResult {
                        upload_url: None,
                        upload_headers: vec![],
                        multipart_urls: None,
                        upload_id: None,
                        storage_path: format!("mock/{}", spec.name),
                        birth_artifact_id: Some(spec.artifact_id.clone()),
                    };
                }
                match spec.upload_parts_input {
                    Some(parts) => PreparedFileResult {
                        upload_url: None,
                        upload_headers: vec![],
                        multipart_urls: Some(
                            (0..parts).map(|i| format!("https://mock/put/{}/part/{i}", spec.name)).collect(),
                        ),
                        upload_id: Some(self.next_id()),
                        storage_path: format!("mock/{}", spec.name),
                        birth_artifact_id: Some(spec.artifact_id.clone()),
                    },
                    None => PreparedFileResult {
                        upload_url: Some(format!("https://mock/put/{}", spec.name)),
                        upload_headers: vec![],
                        multipart_urls: None,
                        upload_id: None,
                        storage_path: format!("mock/{}", spec.name),
                        birth_artifact_id: Some(spec.artifact_id.clone()),
                    },
                }
            })
            .collect())
    }

    async fn complete_multipart_upload_artifact(
        &self,
        _artifact_id: &str,
        _storage_path: &str,
        _completed_parts: &[CompletedPart],
        _upload_id: &str,
    ) -> Result<String> {
        Ok("mock-digest".to_string())
    }

    async fn commit_artifact(&self, _artifact_id: &str) -> Result<String> {
        self.commit_calls.fetch_add(1, Ordering::SeqCst);
        Ok("mock-digest".to_string())
    }

    async fn use_artifact(&self, _artifact_id: &str, _run_id: &str, _entity: &str, _project: &str) -> Result<()> {
        Ok(())
    }

    async fn put_object(&self, url: &str, _headers: &[(String, String)], body: Bytes) -> Result<String> {
        self.put_object_log.lock().unwrap().push(body.clone());
        if let Some(name) = self.fail_save_name.lock().unwrap().as_ref() {
            if url.contains(name.as_str()) {
                return Err(ArtifactError::NonRetryable(name.clone(), "simulated permanent failure".to_string()));
            }
        }
        if self.fail_next_put.swap(false, Ordering::SeqCst) {
            return Err(ArtifactError::Transient("mock", "simulated failure".to_string()));
        }
        Ok("mock-etag".to_string())
    }

    async fn put_object_part(&self, url: &str, body: Bytes) -> Result<String> {
        if self.expire_next_part.swap(false, Ordering::SeqCst) {
            return Err(ArtifactError::UrlExpired(url.to_string()));
        }
        self.put_object(url, &[], body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_backend_dedups_on_repeated_md5() {
        let backend = MockBackend::new();
        let spec = FileSpec {
            artifact_id: "a1".to_string(),
            artifact_manifest_id: "m1".to_string(),
            name: "file.bin".to_string(),
            md5: "deadbeef".to_string(),
            upload_parts_input: None,
        };
        let first = backend.create_artifact_files(&[spec.clone()]).await.unwrap();
        assert!(first[0].upload_url.is_some());

        let second = backend.create_artifact_files(&[spec]).await.unwrap();
        assert!(second[0].upload_url.is_none());
    }

    #[tokio::test]
    async fn mock_backend_returns_one_url_per_part_for_multipart_specs() {
        let backend = MockBackend::new();
        let spec = FileSpec {
            artifact_id: "a1".to_string(),
            artifact_manifest_id: "m1".to_string(),
            name: "big.bin".to_string(),
            md5: "feedface".to_string(),
            upload_parts_input: Some(3),
        };
        let prepared = backend.create_artifact_files(&[spec]).await.unwrap();
        assert!(prepared[0].upload_url.is_none());
        assert_eq!(prepared[0].multipart_urls.as_ref().unwrap().len(), 3);
        assert!(prepared[0].upload_id.is_some());
    }

    #[test]
    fn header_parsing_splits_on_first_colon() {
        let value = json!(["Content-Type: application/octet-stream", "X-Custom: a:b"]);
        let headers = parse_headers(&value);
        assert_eq!(headers[0], ("Content-Type".to_string(), "application/octet-stream".to_string()));
        assert_eq!(headers[1], ("X-Custom".to_string(), "a:b".to_string()));
    }
}
