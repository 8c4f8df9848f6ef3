//! HTTP client for the coordinator API

use crate::common::{Error, Result};
use crate::coordinator::state::{ConnectionState, Group, Member, MembershipState, Tablet};
use futures_util::StreamExt;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::time::Duration;

#[derive(Clone)]
pub struct CoordinatorClient {
    base: String,
    http: reqwest::Client,
}

impl CoordinatorClient {
    pub fn new(base: impl Into<String>) -> Result<Self> {
        let base = base.into();
        let base = if base.starts_with("http://") || base.starts_with("https://") {
            base
        } else {
            format!("http://{}", base)
        };
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn decode<R: DeserializeOwned>(resp: reqwest::Response) -> Result<R> {
        if resp.status().is_success() {
            return Ok(resp.json().await?);
        }
        Err(Self::error_from(resp).await)
    }

    async fn error_from(resp: reqwest::Response) -> Error {
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.unwrap_or_default();
        let msg = body
            .get("error")
            .and_then(|e| e.as_str())
            .unwrap_or("no error message")
            .to_string();
        match status {
            StatusCode::TEMPORARY_REDIRECT => Error::NotLeader(msg),
            StatusCode::SERVICE_UNAVAILABLE => Error::ConnectionFailed(msg),
            StatusCode::REQUEST_TIMEOUT => Error::ConsensusTimeout,
            _ => Error::Http(format!("{}: {}", status, msg)),
        }
    }

    async fn post<B: Serialize, R: DeserializeOwned>(&self, path: &str, body: &B) -> Result<R> {
        let resp = self.http.post(self.url(path)).json(body).send().await?;
        Self::decode(resp).await
    }

    async fn get<R: DeserializeOwned>(&self, path: &str) -> Result<R> {
        let resp = self.http.get(self.url(path)).send().await?;
        Self::decode(resp).await
    }

    pub async fn connect(&self, member: &Member) -> Result<ConnectionState> {
        self.post("/connect", member).await
    }

    pub async fn update_membership(&self, report: &Group) -> Result<()> {
        let _: serde_json::Value = self.post("/membership", report).await?;
        Ok(())
    }

    pub async fn should_serve(&self, tablet: &Tablet) -> Result<Tablet> {
        self.post("/tablet", tablet).await
    }

    pub async fn remove_node(&self, node_id: u64, group_id: u32) -> Result<()> {
        let body = json!({ "node_id": node_id, "group_id": group_id });
        let _: serde_json::Value = self.post("/remove", &body).await?;
        Ok(())
    }

    pub async fn state(&self) -> Result<MembershipState> {
        self.get("/state").await
    }

    pub async fn groups(&self) -> Result<Vec<u32>> {
        let body: serde_json::Value = self.get("/groups").await?;
        serde_json::from_value(body["groups"].clone())
            .map_err(|e| Error::Http(format!("bad /groups response: {}", e)))
    }

    /// Follow the membership stream, handing each snapshot to `on_state`
    /// until it returns false. The stream ending any other way is an error.
    pub async fn stream<F>(&self, mut on_state: F) -> Result<()>
    where
        F: FnMut(MembershipState) -> bool,
    {
        let resp = self.http.get(self.url("/membership/stream")).send().await?;
        if !resp.status().is_success() {
            return Err(Self::error_from(resp).await);
        }
        let mut body = resp.bytes_stream();
        let mut buf = String::new();
        while let Some(chunk) = body.next().await {
            buf.push_str(&String::from_utf8_lossy(&chunk?));
            for event in drain_sse_events(&mut buf) {
                let data = match event {
                    SseEvent::Membership(data) => data,
                    SseEvent::Error(msg) => {
                        return Err(Error::Http(format!("membership stream failed: {}", msg)))
                    }
                };
                let state: MembershipState = serde_json::from_str(&data)
                    .map_err(|e| Error::Http(format!("bad membership event: {}", e)))?;
                if !on_state(state) {
                    return Ok(());
                }
            }
        }
        Err(Error::StreamClosed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Membership(String),
    Error(String),
}

/// Pop every complete `membership` or `error` event from `buf`.
/// Keep-alive comments and other event types are skipped.
pub fn drain_sse_events(buf: &mut String) -> Vec<SseEvent> {
    let mut out = Vec::new();
    while let Some(end) = buf.find("\n\n") {
        let raw: String = buf.drain(..end + 2).collect();
        let mut event = "message";
        let mut data = Vec::new();
        for line in raw.lines() {
            if let Some(v) = line.strip_prefix("event:") {
                event = v.trim();
            } else if let Some(v) = line.strip_prefix("data:") {
                data.push(v.strip_prefix(' ').unwrap_or(v));
            }
        }
        let data = data.join("\n");
        match event {
            "membership" if !data.is_empty() => out.push(SseEvent::Membership(data)),
            "error" => out.push(SseEvent::Error(data)),
            _ => {}
        }
    }
    out
}
