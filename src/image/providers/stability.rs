//! Stability AI image generation backend (REST v1).

use crate::credential::Credential;
use crate::error::{parse_retry_after, sanitize_error_message, Result, StableGenError};
use crate::image::artifact::{Artifact, ArtifactKind, FinishReason};
use crate::image::backend::{Connector, GenerationBackend};
use crate::image::types::{Engine, GenerationRequest, Sampler};
use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default API host.
pub const DEFAULT_HOST: &str = "https://api.stability.ai";

const API_KEY_ENV: &str = "STABILITY_API_KEY";
const HOST_ENV: &str = "STABILITY_HOST";

/// Builder for [`StabilityBackend`] and [`StabilityConnector`].
#[derive(Clone, Default)]
pub struct StabilityBuilder {
    api_key: Option<String>,
    host: Option<String>,
    engine: Engine,
    request_timeout: Option<Duration>,
}

impl StabilityBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the API key. Falls back to `STABILITY_API_KEY` env var.
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Sets the API host. Falls back to `STABILITY_HOST`, then [`DEFAULT_HOST`].
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Sets the engine requests are routed to.
    pub fn engine(mut self, engine: Engine) -> Self {
        self.engine = engine;
        self
    }

    /// Sets a client-side request timeout. Without one, the transport default applies.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    fn resolve_host(&self) -> String {
        let host = self
            .host
            .clone()
            .or_else(|| std::env::var(HOST_ENV).ok())
            .map(|h| normalize_host(&h))
            .filter(|h| !h.is_empty());
        host.unwrap_or_else(|| DEFAULT_HOST.to_string())
    }

    /// Builds a connector that creates a backend per credential.
    pub fn connector(self) -> StabilityConnector {
        StabilityConnector {
            host: self.resolve_host(),
            engine: self.engine,
            request_timeout: self.request_timeout,
        }
    }

    /// Builds the backend, resolving the API key.
    pub fn build(self) -> Result<StabilityBackend> {
        let api_key = self
            .api_key
            .clone()
            .or_else(|| std::env::var(API_KEY_ENV).ok())
            .ok_or_else(|| {
                StableGenError::Auth(format!("{API_KEY_ENV} not set and no API key provided"))
            })?;

        let api_key = api_key.trim().to_string();
        if api_key.is_empty() {
            return Err(StableGenError::Auth("API key is empty".into()));
        }
        if reqwest::header::HeaderValue::from_str(&format!("Bearer {api_key}")).is_err() {
            return Err(StableGenError::Auth(
                "API key contains characters not allowed in a header".into(),
            ));
        }

        let mut client = reqwest::Client::builder();
        if let Some(timeout) = self.request_timeout {
            client = client.timeout(timeout);
        }

        Ok(StabilityBackend {
            client: client.build()?,
            host: self.resolve_host(),
            api_key,
            engine: self.engine,
            request_timeout: self.request_timeout,
        })
    }
}

impl std::fmt::Debug for StabilityBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StabilityBuilder")
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("host", &self.host)
            .field("engine", &self.engine)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Ensures a scheme is present and strips trailing slashes.
fn normalize_host(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    if host.is_empty() || host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("https://{host}")
    }
}

/// Stability AI backend.
pub struct StabilityBackend {
    client: reqwest::Client,
    host: String,
    api_key: String,
    engine: Engine,
    request_timeout: Option<Duration>,
}

impl StabilityBackend {
    /// Creates a new `StabilityBuilder`.
    pub fn builder() -> StabilityBuilder {
        StabilityBuilder::new()
    }

    /// The host this backend talks to.
    pub fn host(&self) -> &str {
        &self.host
    }

    fn text_to_image_url(&self) -> String {
        format!(
            "{}/v1/generation/{}/text-to-image",
            self.host,
            self.engine.as_str()
        )
    }

    fn account_url(&self) -> String {
        format!("{}/v1/user/account", self.host)
    }

    fn transport_error(&self, err: reqwest::Error) -> StableGenError {
        match self.request_timeout {
            Some(timeout) if err.is_timeout() => StableGenError::Timeout(timeout),
            _ => StableGenError::Network(err),
        }
    }
}

#[async_trait]
impl GenerationBackend for StabilityBackend {
    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<Artifact>> {
        let body = TextToImageRequest::from_generation_request(request);
        tracing::debug!(
            engine = %self.engine,
            seed = body.seed,
            steps = body.steps,
            "submitting text-to-image request"
        );

        let response = self
            .client
            .post(self.text_to_image_url())
            .bearer_auth(&self.api_key)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let text = response.text().await.unwrap_or_default();
            if is_prompt_rejection(status.as_u16(), &text) {
                tracing::debug!("prompt rejected by moderation");
                return Ok(vec![Artifact::filtered()]);
            }
            return Err(parse_error(status.as_u16(), &text, &headers));
        }

        let parsed: TextToImageResponse = response
            .json()
            .await
            .map_err(|e| self.transport_error(e))?;
        tracing::debug!(artifacts = parsed.artifacts.len(), "received response");

        Ok(parsed
            .artifacts
            .into_iter()
            .map(StabilityArtifact::into_artifact)
            .collect())
    }

    async fn health_check(&self) -> Result<()> {
        let response = self
            .client
            .get(self.account_url())
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let headers = response.headers().clone();
        let text = response.text().await.unwrap_or_default();
        Err(parse_error(status.as_u16(), &text, &headers))
    }

    fn name(&self) -> &str {
        "Stability AI"
    }
}

/// Connector producing a [`StabilityBackend`] per credential.
#[derive(Debug, Clone)]
pub struct StabilityConnector {
    host: String,
    engine: Engine,
    request_timeout: Option<Duration>,
}

impl StabilityConnector {
    /// Creates a connector from environment defaults.
    pub fn from_env() -> Self {
        StabilityBuilder::new().connector()
    }

    /// The host backends will talk to.
    pub fn host(&self) -> &str {
        &self.host
    }
}

#[async_trait]
impl Connector for StabilityConnector {
    async fn connect(&self, credential: &Credential) -> Result<Box<dyn GenerationBackend>> {
        let mut builder = StabilityBuilder::new()
            .api_key(credential.expose())
            .host(self.host.clone())
            .engine(self.engine);
        if let Some(timeout) = self.request_timeout {
            builder = builder.request_timeout(timeout);
        }
        Ok(Box::new(builder.build()?))
    }
}

fn parse_error(status: u16, text: &str, headers: &reqwest::header::HeaderMap) -> StableGenError {
    let message = serde_json::from_str::<StabilityErrorBody>(text)
        .ok()
        .and_then(|body| body.message)
        .unwrap_or_else(|| text.to_string());
    let message = sanitize_error_message(&message);

    match status {
        401 | 403 => StableGenError::Auth(message),
        429 => {
            let retry_after = parse_retry_after(headers).map(Duration::from_secs);
            StableGenError::RateLimited { retry_after }
        }
        400 => StableGenError::InvalidRequest(message),
        _ => StableGenError::Api { status, message },
    }
}

/// The API refuses prompts that trip moderation with a 400 `invalid_prompts`.
fn is_prompt_rejection(status: u16, text: &str) -> bool {
    status == 400
        && serde_json::from_str::<StabilityErrorBody>(text)
            .ok()
            .and_then(|body| body.name)
            .is_some_and(|name| name == "invalid_prompts")
}

#[derive(Debug, Serialize)]
struct TextPrompt {
    text: String,
    weight: f32,
}

#[derive(Debug, Serialize)]
struct TextToImageRequest {
    text_prompts: Vec<TextPrompt>,
    cfg_scale: f32,
    height: u32,
    width: u32,
    samples: u32,
    steps: u32,
    seed: u32,
    sampler: Sampler,
}

impl TextToImageRequest {
    fn from_generation_request(req: &GenerationRequest) -> Self {
        let params = req.params();
        Self {
            text_prompts: vec![TextPrompt {
                text: req.prompt().to_string(),
                weight: 1.0,
            }],
            cfg_scale: params.cfg_scale,
            height: params.height,
            width: params.width,
            samples: params.samples,
            steps: params.steps,
            seed: params.seed,
            sampler: params.sampler,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TextToImageResponse {
    #[serde(default)]
    artifacts: Vec<StabilityArtifact>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StabilityArtifact {
    #[serde(default)]
    base64: Option<String>,
    #[serde(default)]
    seed: Option<u64>,
    #[serde(default)]
    finish_reason: StabilityFinishReason,
}

#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum StabilityFinishReason {
    #[default]
    Success,
    ContentFiltered,
    Error,
    #[serde(other)]
    Unknown,
}

impl StabilityArtifact {
    /// Converts one wire artifact. A payload that is not valid base64 becomes
    /// a non-image artifact that finished with an error, so it cannot mask an
    /// earlier filtered or image artifact.
    fn into_artifact(self) -> Artifact {
        let finish_reason = match self.finish_reason {
            StabilityFinishReason::Success => FinishReason::Success,
            StabilityFinishReason::ContentFiltered => FinishReason::Filter,
            StabilityFinishReason::Error | StabilityFinishReason::Unknown => FinishReason::Error,
        };

        let (kind, finish_reason, binary) = match self.base64.filter(|b| !b.is_empty()) {
            Some(b64) => match base64::engine::general_purpose::STANDARD.decode(b64.trim()) {
                Ok(bytes) => (ArtifactKind::Image, finish_reason, bytes),
                Err(e) => {
                    tracing::warn!(seed = ?self.seed, "undecodable artifact payload: {e}");
                    (ArtifactKind::Other, FinishReason::Error, Vec::new())
                }
            },
            None => (ArtifactKind::Other, finish_reason, Vec::new()),
        };

        Artifact {
            kind,
            finish_reason,
            binary,
            seed: self.seed,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StabilityErrorBody {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client;
    use crate::credential::{CredentialGate, ValidationOutcome};
    use crate::testing::{png_bytes, StubServer};
    use base64::Engine as _;
    use std::sync::Arc;

    #[test]
    fn test_builder_with_explicit_key() {
        let backend = StabilityBuilder::new()
            .api_key("sk-test")
            .host("https://example.test")
            .build()
            .unwrap();
        assert_eq!(backend.api_key, "sk-test");
        assert_eq!(backend.host(), "https://example.test");
        assert_eq!(backend.name(), "Stability AI");
    }

    #[test]
    fn test_builder_rejects_empty_key() {
        let result = StabilityBuilder::new().api_key("   ").build();
        assert!(matches!(result, Err(StableGenError::Auth(_))));
    }

    #[test]
    fn test_builder_rejects_key_with_control_chars() {
        let result = StabilityBuilder::new().api_key("sk-bad\nkey").build();
        assert!(matches!(result, Err(StableGenError::Auth(_))));
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("https://api.stability.ai/"), DEFAULT_HOST);
        assert_eq!(normalize_host("api.stability.ai"), DEFAULT_HOST);
        assert_eq!(normalize_host("http://localhost:8080"), "http://localhost:8080");
        assert_eq!(normalize_host("  "), "");
    }

    #[test]
    fn test_urls() {
        let backend = StabilityBuilder::new()
            .api_key("sk-test")
            .host("https://example.test/")
            .build()
            .unwrap();
        assert_eq!(
            backend.text_to_image_url(),
            "https://example.test/v1/generation/stable-diffusion-xl-1024-v1-0/text-to-image"
        );
        assert_eq!(
            backend.account_url(),
            "https://example.test/v1/user/account"
        );
    }

    #[test]
    fn test_request_serialization_uses_fixed_params() {
        let req = GenerationRequest::new("a red cube");
        let body = TextToImageRequest::from_generation_request(&req);
        let json = serde_json::to_value(&body).unwrap();

        assert_eq!(json["text_prompts"][0]["text"], "a red cube");
        assert_eq!(json["text_prompts"][0]["weight"], 1.0);
        assert_eq!(json["seed"], 992446758);
        assert_eq!(json["steps"], 50);
        assert_eq!(json["cfg_scale"], 8.0);
        assert_eq!(json["width"], 1024);
        assert_eq!(json["height"], 1024);
        assert_eq!(json["samples"], 1);
        assert_eq!(json["sampler"], "K_DPMPP_2M");
    }

    #[test]
    fn test_response_deserialization() {
        let json = r#"{"artifacts": [
            {"base64": "iVBORw0KGgoAAAAA", "seed": 992446758, "finishReason": "SUCCESS"},
            {"base64": "AQID", "seed": 1, "finishReason": "CONTENT_FILTERED"},
            {"seed": 2, "finishReason": "SOMETHING_NEW"}
        ]}"#;
        let resp: TextToImageResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.artifacts.len(), 3);

        let artifacts: Vec<Artifact> = resp
            .artifacts
            .into_iter()
            .map(StabilityArtifact::into_artifact)
            .collect();

        assert_eq!(artifacts[0].kind, ArtifactKind::Image);
        assert_eq!(artifacts[0].finish_reason, FinishReason::Success);
        assert_eq!(artifacts[0].seed, Some(992446758));
        assert_eq!(
            &artifacts[0].binary[..8],
            &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]
        );

        assert_eq!(artifacts[1].finish_reason, FinishReason::Filter);
        assert_eq!(artifacts[1].binary, vec![1, 2, 3]);

        assert_eq!(artifacts[2].kind, ArtifactKind::Other);
        assert_eq!(artifacts[2].finish_reason, FinishReason::Error);
    }

    #[test]
    fn test_invalid_base64_is_not_an_image() {
        let artifact = StabilityArtifact {
            base64: Some("!!not base64!!".into()),
            seed: Some(3),
            finish_reason: StabilityFinishReason::Success,
        };
        let artifact = artifact.into_artifact();
        assert_eq!(artifact.kind, ArtifactKind::Other);
        assert_eq!(artifact.finish_reason, FinishReason::Error);
        assert!(artifact.binary.is_empty());
        assert_eq!(artifact.seed, Some(3));
    }

    #[test]
    fn test_parse_error_mapping() {
        let headers = reqwest::header::HeaderMap::new();
        let body = r#"{"id":"abc","name":"unauthorized","message":"missing authorization header"}"#;

        match parse_error(401, body, &headers) {
            StableGenError::Auth(msg) => assert_eq!(msg, "missing authorization header"),
            other => panic!("expected Auth, got {other:?}"),
        }
        assert!(matches!(
            parse_error(429, "", &headers),
            StableGenError::RateLimited { retry_after: None }
        ));
        assert!(matches!(
            parse_error(400, body, &headers),
            StableGenError::InvalidRequest(_)
        ));
        match parse_error(502, "bad gateway", &headers) {
            StableGenError::Api { status, message } => {
                assert_eq!(status, 502);
                assert_eq!(message, "bad gateway");
            }
            other => panic!("expected Api, got {other:?}"),
        }
    }

    #[test]
    fn test_rate_limit_reads_retry_after() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, "7".parse().unwrap());
        assert!(matches!(
            parse_error(429, "", &headers),
            StableGenError::RateLimited {
                retry_after: Some(d)
            } if d == Duration::from_secs(7)
        ));
    }

    #[test]
    fn test_prompt_rejection_detection() {
        let rejected = r#"{"id":"x","name":"invalid_prompts","message":"Invalid prompts detected"}"#;
        assert!(is_prompt_rejection(400, rejected));
        assert!(!is_prompt_rejection(401, rejected));
        assert!(!is_prompt_rejection(
            400,
            r#"{"name":"bad_request","message":"height must be a multiple of 64"}"#
        ));
        assert!(!is_prompt_rejection(400, "not json"));
    }

    fn backend_for(server: &StubServer) -> StabilityBackend {
        StabilityBuilder::new()
            .api_key("sk-test-0123456789")
            .host(server.url())
            .build()
            .unwrap()
    }

    fn artifacts_body(artifacts: serde_json::Value) -> String {
        serde_json::json!({ "artifacts": artifacts }).to_string()
    }

    fn png_base64() -> String {
        base64::engine::general_purpose::STANDARD.encode(png_bytes())
    }

    #[tokio::test]
    async fn test_generate_sends_bearer_and_fixed_body() {
        let body = artifacts_body(serde_json::json!([
            {"base64": png_base64(), "seed": 992446758, "finishReason": "SUCCESS"}
        ]));
        let server = StubServer::start(vec![(200, body)]).await;
        let backend = backend_for(&server);

        let artifacts = backend
            .generate(&GenerationRequest::new("a red cube"))
            .await
            .unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].binary, png_bytes());
        assert_eq!(artifacts[0].seed, Some(992446758));

        let requests = server.requests();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.method, "POST");
        assert_eq!(
            request.path,
            "/v1/generation/stable-diffusion-xl-1024-v1-0/text-to-image"
        );
        assert_eq!(
            request.header("authorization"),
            Some("Bearer sk-test-0123456789")
        );
        assert_eq!(request.header("accept"), Some("application/json"));

        let json = request.json();
        assert_eq!(json["text_prompts"][0]["text"], "a red cube");
        assert_eq!(json["seed"], 992446758);
        assert_eq!(json["steps"], 50);
        assert_eq!(json["cfg_scale"], 8.0);
        assert_eq!(json["width"], 1024);
        assert_eq!(json["height"], 1024);
        assert_eq!(json["samples"], 1);
        assert_eq!(json["sampler"], "K_DPMPP_2M");
    }

    #[tokio::test]
    async fn test_filtered_artifact_wins_over_later_undecodable_one() {
        let body = artifacts_body(serde_json::json!([
            {"finishReason": "CONTENT_FILTERED"},
            {"base64": "!!!", "finishReason": "SUCCESS"}
        ]));
        let server = StubServer::start(vec![(200, body)]).await;
        let backend = backend_for(&server);

        let outcome = client::run(&backend, GenerationRequest::new("a red cube")).await;
        assert!(outcome.is_filtered(), "got {outcome:?}");
    }

    #[tokio::test]
    async fn test_first_image_wins_over_later_undecodable_one() {
        let body = artifacts_body(serde_json::json!([
            {"base64": png_base64(), "finishReason": "SUCCESS"},
            {"base64": "!!!", "finishReason": "SUCCESS"}
        ]));
        let server = StubServer::start(vec![(200, body)]).await;
        let backend = backend_for(&server);

        let outcome = client::run(&backend, GenerationRequest::new("a red cube")).await;
        assert_eq!(outcome.into_image().unwrap().data, png_bytes());
    }

    #[tokio::test]
    async fn test_only_undecodable_artifact_is_an_error() {
        let body = artifacts_body(serde_json::json!([
            {"base64": "!!!", "finishReason": "SUCCESS"}
        ]));
        let server = StubServer::start(vec![(200, body)]).await;
        let backend = backend_for(&server);

        let outcome = client::run(&backend, GenerationRequest::new("a red cube")).await;
        assert!(outcome.is_error());
    }

    #[tokio::test]
    async fn test_moderated_prompt_surfaces_as_filtered() {
        let body = r#"{"id":"x","name":"invalid_prompts","message":"Invalid prompts detected"}"#;
        let server = StubServer::start(vec![(400, body.to_string())]).await;
        let backend = backend_for(&server);

        let outcome = client::run(&backend, GenerationRequest::new("something banned")).await;
        assert!(outcome.is_filtered(), "got {outcome:?}");
    }

    #[tokio::test]
    async fn test_error_body_is_sanitized() {
        let body = r#"{"id":"x","name":"server_error","message":"upstream rejected sk-abcdef1234567890 today"}"#;
        let server = StubServer::start(vec![(500, body.to_string())]).await;
        let backend = backend_for(&server);

        match backend.generate(&GenerationRequest::new("a red cube")).await {
            Err(StableGenError::Api { status, message }) => {
                assert_eq!(status, 500);
                assert_eq!(message, "upstream rejected sk-*** today");
            }
            other => panic!("expected Api error, got {other:?}"),
        }
    }

    fn gate_for(server: &StubServer) -> CredentialGate {
        CredentialGate::new(Arc::new(StabilityBuilder::new().host(server.url()).connector()))
    }

    #[tokio::test]
    async fn test_account_check_accepts_key() {
        let server = StubServer::start(vec![(200, r#"{"id":"user-1"}"#.to_string())]).await;

        let outcome = gate_for(&server).check("sk-test-0123456789").await;
        assert!(outcome.is_valid());

        let requests = server.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, "GET");
        assert_eq!(requests[0].path, "/v1/user/account");
        assert_eq!(
            requests[0].header("authorization"),
            Some("Bearer sk-test-0123456789")
        );
    }

    #[tokio::test]
    async fn test_account_check_unauthorized_is_rejected() {
        let body = r#"{"id":"x","name":"unauthorized","message":"invalid API key"}"#;
        let server = StubServer::start(vec![(401, body.to_string())]).await;

        let outcome = gate_for(&server).check("sk-wrong-0123456789").await;
        assert!(matches!(outcome, ValidationOutcome::Rejected(_)), "got {outcome:?}");
    }

    #[tokio::test]
    async fn test_account_check_server_error_is_unreachable() {
        let server = StubServer::start(vec![(503, "unavailable".to_string())]).await;

        let outcome = gate_for(&server).check("sk-test-0123456789").await;
        assert!(matches!(outcome, ValidationOutcome::Unreachable(_)), "got {outcome:?}");
        assert_eq!(server.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_connector_builds_backend_for_credential() {
        let connector = StabilityBuilder::new()
            .host("https://example.test")
            .connector();
        assert_eq!(connector.host(), "https://example.test");

        let backend = connector.connect(&Credential::new("sk-valid")).await.unwrap();
        assert_eq!(backend.name(), "Stability AI");

        let result = connector.connect(&Credential::new("")).await;
        assert!(matches!(result, Err(StableGenError::Auth(_))));
    }
}
