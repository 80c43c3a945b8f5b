//! Stand-ins for the generation service, used by unit tests.
//!
//! [`FakeService`] sits at the trait seam. [`StubServer`] is a loopback HTTP
//! server for exercising the real Stability backend.

use crate::credential::Credential;
use crate::error::{Result, StableGenError};
use crate::image::{Artifact, Connector, GenerationBackend, GenerationRequest};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// A minimal valid PNG header padded to the length format detection needs.
pub(crate) fn png_bytes() -> Vec<u8> {
    vec![0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0x0D, 0x49, 0x48]
}

#[derive(Default)]
struct State {
    accepted_key: String,
    health_failures: u32,
    responses: VecDeque<Result<Vec<Artifact>>>,
    requests: Vec<GenerationRequest>,
    connects: usize,
    health_checks: usize,
    stall: bool,
}

/// Scriptable fake service. Clones share state.
#[derive(Clone, Default)]
pub(crate) struct FakeService {
    state: Arc<Mutex<State>>,
}

impl FakeService {
    pub(crate) fn accepting(key: &str) -> Self {
        let service = Self::default();
        service.lock().accepted_key = key.to_string();
        service
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// The next `n` health checks fail with a transient error.
    pub(crate) fn fail_health_checks(&self, n: u32) {
        self.lock().health_failures = n;
    }

    pub(crate) fn respond_with(&self, response: Result<Vec<Artifact>>) {
        self.lock().responses.push_back(response);
    }

    /// Generation requests never complete.
    pub(crate) fn stall(&self) {
        self.lock().stall = true;
    }

    pub(crate) fn requests(&self) -> Vec<GenerationRequest> {
        self.lock().requests.clone()
    }

    pub(crate) fn connects(&self) -> usize {
        self.lock().connects
    }

    pub(crate) fn health_checks(&self) -> usize {
        self.lock().health_checks
    }
}

#[async_trait]
impl Connector for FakeService {
    async fn connect(&self, credential: &Credential) -> Result<Box<dyn GenerationBackend>> {
        self.lock().connects += 1;
        if credential.is_blank() {
            return Err(StableGenError::Auth("API key is empty".into()));
        }
        Ok(Box::new(FakeBackend {
            service: self.clone(),
            key: credential.expose().to_string(),
        }))
    }
}

struct FakeBackend {
    service: FakeService,
    key: String,
}

#[async_trait]
impl GenerationBackend for FakeBackend {
    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<Artifact>> {
        let (response, stall) = {
            let mut state = self.service.lock();
            state.requests.push(request.clone());
            (state.responses.pop_front(), state.stall)
        };
        if stall {
            std::future::pending::<()>().await;
        }
        response.unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn health_check(&self) -> Result<()> {
        let mut state = self.service.lock();
        state.health_checks += 1;
        if self.key != state.accepted_key {
            return Err(StableGenError::Auth("invalid API key".into()));
        }
        if state.health_failures > 0 {
            state.health_failures -= 1;
            return Err(StableGenError::Api {
                status: 503,
                message: "service unavailable".into(),
            });
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "fake"
    }
}

/// A request captured by [`StubServer`].
#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub(crate) method: String,
    pub(crate) path: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl RecordedRequest {
    pub(crate) fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub(crate) fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap()
    }
}

/// Loopback HTTP/1.1 server answering one connection per scripted response.
pub(crate) struct StubServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl StubServer {
    /// Serves `responses` (status, JSON body) in order, then stops accepting.
    pub(crate) async fn start(responses: Vec<(u16, String)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&requests);

        tokio::spawn(async move {
            for (status, body) in responses {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                if let Some(request) = read_request(&mut stream).await {
                    recorded.lock().unwrap().push(request);
                }
                let response = format!(
                    "HTTP/1.1 {status} Stub\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });

        Self { addr, requests }
    }

    pub(crate) fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub(crate) fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

async fn read_request(stream: &mut TcpStream) -> Option<RecordedRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split(' ');
    let method = request_line.next()?.to_string();
    let path = request_line.next()?.to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_ascii_lowercase(), value.trim().to_string()))
        .collect();

    let content_length = headers
        .iter()
        .find(|(key, _)| key == "content-length")
        .and_then(|(_, value)| value.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = buf[head_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }

    Some(RecordedRequest {
        method,
        path,
        headers,
        body,
    })
}
