//! Call-record service client.
//!
//! Call metadata is written for audit only. Every write is fire-and-forget
//! from the call's point of view: operations for one call are queued on a
//! [`RecordSession`] and executed in order on a background task, failures
//! are logged and dropped.

use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::signaling::{CallId, CallType, EndReason, UserId};

/// Persistence of call metadata.
#[async_trait]
pub trait CallRecordStore: Send + Sync {
    /// Create the record for a new outgoing call; returns the record id.
    async fn register_call(
        &self,
        call_id: &CallId,
        receiver: &UserId,
        call_type: CallType,
        offer: &str,
    ) -> Result<String>;

    async fn record_answer(&self, call_id: &CallId, answer: &str) -> Result<()>;

    async fn record_end(&self, call_id: &CallId, reason: EndReason, duration_secs: u64)
        -> Result<()>;
}

/// Used when no record service is configured.
pub struct NoopCallRecords;

#[async_trait]
impl CallRecordStore for NoopCallRecords {
    async fn register_call(
        &self,
        call_id: &CallId,
        receiver: &UserId,
        call_type: CallType,
        _offer: &str,
    ) -> Result<String> {
        tracing::debug!("No record service: {} call {} to {}", call_type, call_id, receiver);
        Ok(call_id.to_string())
    }

    async fn record_answer(&self, call_id: &CallId, _answer: &str) -> Result<()> {
        tracing::debug!("No record service: call {} answered", call_id);
        Ok(())
    }

    async fn record_end(
        &self,
        call_id: &CallId,
        reason: EndReason,
        duration_secs: u64,
    ) -> Result<()> {
        tracing::debug!(
            "No record service: call {} {} after {}s",
            call_id,
            reason,
            duration_secs
        );
        Ok(())
    }
}

/// REST client for the app's call-record endpoints.
pub struct HttpCallRecords {
    http: reqwest::Client,
    base_url: String,
}

impl HttpCallRecords {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn call_url(&self, call_id: &CallId, action: &str) -> String {
        format!("{}/calls/{}/{}", self.base_url, call_id, action)
    }

    async fn patch(&self, url: &str, payload: serde_json::Value) -> Result<()> {
        tracing::debug!("Call record PATCH {}", url);
        let resp = self
            .http
            .patch(url)
            .json(&payload)
            .send()
            .await
            .context("Call record PATCH failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Call record PATCH {} returned {}: {}", url, status, body);
        }
        Ok(())
    }
}

#[async_trait]
impl CallRecordStore for HttpCallRecords {
    async fn register_call(
        &self,
        call_id: &CallId,
        receiver: &UserId,
        call_type: CallType,
        offer: &str,
    ) -> Result<String> {
        let url = format!("{}/calls", self.base_url);
        let payload = serde_json::json!({
            "callId": call_id,
            "receiverId": receiver,
            "type": call_type,
            "offer": offer,
        });

        tracing::debug!("Call record POST {}", url);
        let resp = self
            .http
            .post(&url)
            .json(&payload)
            .send()
            .await
            .context("Call record POST failed")?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            anyhow::bail!("Call record POST returned {}: {}", status, body);
        }

        let json: serde_json::Value =
            serde_json::from_str(&body).context("Call record response is not valid JSON")?;
        let record_id = json
            .pointer("/id")
            .or_else(|| json.pointer("/_id"))
            .or_else(|| json.pointer("/call/id"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .context("No id in call record response")?;
        Ok(record_id)
    }

    async fn record_answer(&self, call_id: &CallId, answer: &str) -> Result<()> {
        self.patch(
            &self.call_url(call_id, "answer"),
            serde_json::json!({ "answer": answer }),
        )
        .await
    }

    async fn record_end(
        &self,
        call_id: &CallId,
        reason: EndReason,
        duration_secs: u64,
    ) -> Result<()> {
        self.patch(
            &self.call_url(call_id, "end"),
            serde_json::json!({ "reason": reason, "durationSeconds": duration_secs }),
        )
        .await
    }
}

enum RecordOp {
    Register {
        receiver: UserId,
        call_type: CallType,
        offer: String,
    },
    Answer {
        answer: String,
    },
    End {
        reason: EndReason,
        duration_secs: u64,
    },
}

/// Opens one [`RecordSession`] per call.
#[derive(Clone)]
pub struct RecordKeeper {
    store: Arc<dyn CallRecordStore>,
}

impl RecordKeeper {
    pub fn new(store: Arc<dyn CallRecordStore>) -> Self {
        Self { store }
    }

    /// Start the ordered writer for `call_id`. Must be called inside a
    /// Tokio runtime.
    pub fn open(&self, call_id: CallId) -> RecordSession {
        let (tx, mut rx) = mpsc::unbounded_channel::<RecordOp>();
        let record_id = Arc::new(OnceLock::new());

        let store = self.store.clone();
        let id = call_id.clone();
        let assigned = record_id.clone();
        tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                let result = match op {
                    RecordOp::Register {
                        receiver,
                        call_type,
                        offer,
                    } => match store.register_call(&id, &receiver, call_type, &offer).await {
                        Ok(server_id) => {
                            tracing::debug!("Call {} recorded as {}", id, server_id);
                            let _ = assigned.set(server_id);
                            Ok(())
                        }
                        Err(e) => Err(e),
                    },
                    RecordOp::Answer { answer } => store.record_answer(&id, &answer).await,
                    RecordOp::End {
                        reason,
                        duration_secs,
                    } => store.record_end(&id, reason, duration_secs).await,
                };
                if let Err(e) = result {
                    tracing::warn!("Call record update for {} failed: {:#}", id, e);
                }
            }
        });

        RecordSession {
            call_id,
            tx,
            record_id,
        }
    }
}

/// Ordered, fire-and-forget record writes for one call.
pub struct RecordSession {
    call_id: CallId,
    tx: mpsc::UnboundedSender<RecordOp>,
    record_id: Arc<OnceLock<String>>,
}

impl RecordSession {
    pub fn register(&self, receiver: &UserId, call_type: CallType, offer: &str) {
        self.push(RecordOp::Register {
            receiver: receiver.clone(),
            call_type,
            offer: offer.to_string(),
        });
    }

    pub fn answer(&self, answer: &str) {
        self.push(RecordOp::Answer {
            answer: answer.to_string(),
        });
    }

    pub fn end(&self, reason: EndReason, duration_secs: u64) {
        self.push(RecordOp::End {
            reason,
            duration_secs,
        });
    }

    /// Id assigned by the record service, once it has answered.
    pub fn record_id(&self) -> Option<String> {
        self.record_id.get().cloned()
    }

    fn push(&self, op: RecordOp) {
        if self.tx.send(op).is_err() {
            tracing::warn!("Record writer for {} is gone", self.call_id);
        }
    }
}
