use anyhow::{bail, Context, Result};

use crate::codec::Pipeline;
use crate::collector::CollectorHandle;
use crate::config::UplinkConfig;
use crate::table::Snapshot;

/// Path the collector accepts snapshots on.
pub const SUBMIT_PATH: &str = "/v1/tables";

/// Where flushed snapshots go.
#[derive(Debug, Clone)]
pub enum Uplink {
    /// Remote collector over HTTP.
    Http(HttpUplink),
    /// Collector running in the same process.
    Channel(CollectorHandle),
}

impl Uplink {
    pub fn http(cfg: &UplinkConfig) -> Result<Self> {
        HttpUplink::new(cfg).map(Self::Http)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Http(_) => "http",
            Self::Channel(_) => "channel",
        }
    }

    pub async fn send(&self, snapshot: Snapshot) -> Result<()> {
        match self {
            Self::Http(h) => h.send(&snapshot).await,
            Self::Channel(handle) => handle.submit(snapshot).await,
        }
    }
}

/// HTTP client for the collector's snapshot endpoint.
#[derive(Debug, Clone)]
pub struct HttpUplink {
    client: reqwest::Client,
    url: String,
    pipeline: Pipeline,
}

impl HttpUplink {
    pub fn new(cfg: &UplinkConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .context("building uplink HTTP client")?;

        Ok(Self {
            client,
            url: submit_url(&cfg.endpoint),
            pipeline: cfg.pipeline(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn send(&self, snapshot: &Snapshot) -> Result<()> {
        let json = serde_json::to_vec(snapshot).context("serializing snapshot")?;
        let raw_len = json.len();
        let body = self
            .pipeline
            .encode(&json)
            .context("encoding snapshot body")?;
        let body_len = body.len();

        let resp = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/octet-stream")
            .body(body)
            .send()
            .await
            .context("sending snapshot")?;

        let status = resp.status();
        let _ = resp.bytes().await;

        if !status.is_success() {
            bail!("collector returned unexpected status: {status}");
        }

        tracing::debug!(
            keys = snapshot.table.len(),
            raw_bytes = raw_len,
            body_bytes = body_len,
            "sent snapshot",
        );

        Ok(())
    }
}

fn submit_url(endpoint: &str) -> String {
    format!("{}{SUBMIT_PATH}", endpoint.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Bytes;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::Router;
    use parking_lot::Mutex;

    use super::*;
    use crate::codec::Transform;
    use crate::table::Tick;

    type Received = Arc<Mutex<Vec<Bytes>>>;

    async fn capture(State(received): State<Received>, body: Bytes) -> StatusCode {
        received.lock().push(body);
        StatusCode::NO_CONTENT
    }

    async fn reject() -> StatusCode {
        StatusCode::SERVICE_UNAVAILABLE
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        format!("http://{addr}")
    }

    fn uplink_config(endpoint: String, codec: Vec<Transform>) -> UplinkConfig {
        UplinkConfig {
            endpoint,
            timeout: Duration::from_secs(5),
            codec,
        }
    }

    fn snapshot() -> Snapshot {
        Snapshot {
            table: [(
                7,
                vec![Tick {
                    time: 1_700_000_000,
                    sum: 3,
                    count: 1,
                }],
            )]
            .into_iter()
            .collect(),
        }
    }

    #[test]
    fn test_submit_url() {
        assert_eq!(submit_url("http://c:8100"), "http://c:8100/v1/tables");
        assert_eq!(submit_url("http://c:8100/"), "http://c:8100/v1/tables");
    }

    #[tokio::test]
    async fn test_http_uplink_sends_encoded_body() {
        let received: Received = Arc::default();
        let router = Router::new()
            .route(SUBMIT_PATH, post(capture))
            .with_state(Arc::clone(&received));
        let endpoint = serve(router).await;

        let codec = vec![Transform::Zstd, Transform::Xor { seed: 9 }];
        let uplink = Uplink::http(&uplink_config(endpoint, codec.clone())).expect("uplink");
        assert_eq!(uplink.name(), "http");

        uplink.send(snapshot()).await.expect("send");

        let bodies = received.lock().clone();
        assert_eq!(bodies.len(), 1);
        let json = Pipeline::new(codec).decode(&bodies[0]).expect("decode");
        let got: Snapshot = serde_json::from_slice(&json).expect("json");
        assert_eq!(got, snapshot());
    }

    #[tokio::test]
    async fn test_http_uplink_reports_error_status() {
        let router = Router::new().route(SUBMIT_PATH, post(reject));
        let endpoint = serve(router).await;

        let uplink = Uplink::http(&uplink_config(endpoint, Vec::new())).expect("uplink");
        let err = uplink.send(snapshot()).await.unwrap_err();
        assert!(err.to_string().contains("503"), "unexpected error: {err}");
    }
}
