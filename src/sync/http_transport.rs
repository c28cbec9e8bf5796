use std::io::{BufRead, BufReader};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};
use reqwest::blocking::Client;
use reqwest::header;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    ConversationMeta, EventSubscription, PushOutcome, RemoteChange, RemoteConversation,
    SyncTransport, TransportEvent,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetaItemWire {
    conversation_id: String,
    revision: u64,
    deleted: bool,
    #[serde(default)]
    updated_at: i64,
}

#[derive(Debug, Deserialize)]
struct ListResponseWire {
    items: Vec<MetaItemWire>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetResponseWire {
    conversation_id: String,
    revision: u64,
    deleted: bool,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteResponseWire {
    revision: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConflictResponseWire {
    revision: u64,
    deleted: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangeEventWire {
    conversation_id: String,
    revision: u64,
    deleted: bool,
}

#[derive(Debug, Serialize)]
struct PushBodyWire<'a> {
    #[serde(rename = "baseRevision")]
    base_revision: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a Value>,
}

fn client() -> Client {
    static CLIENT: OnceLock<Client> = OnceLock::new();
    CLIENT.get_or_init(Client::new).clone()
}

fn events_client() -> Client {
    // The events stream stays open until the server's TTL close, so this
    // client must not carry the default total-request timeout.
    static CLIENT: OnceLock<Client> = OnceLock::new();
    CLIENT
        .get_or_init(|| {
            Client::builder()
                .timeout(None::<Duration>)
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new())
        })
        .clone()
}

/// Transport against a remote sync server over HTTP. Authentication is the
/// outer deployment's concern; this client forwards a bearer token when it
/// has one and otherwise identifies the user directly (in-process
/// deployments).
pub struct HttpTransport {
    base_url: String,
    user_id: String,
    bearer_token: Option<String>,
}

impl HttpTransport {
    pub fn new(base_url: &str, user_id: &str, bearer_token: Option<String>) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(anyhow!("missing_base_url"));
        }
        Ok(Self {
            base_url,
            user_id: user_id.to_string(),
            bearer_token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn request(
        &self,
        client: &Client,
        method: reqwest::Method,
        path: &str,
    ) -> reqwest::blocking::RequestBuilder {
        let mut builder = client
            .request(method, self.url(path))
            .header("x-sync-user", &self.user_id);
        if let Some(token) = &self.bearer_token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    fn push(
        &self,
        method: reqwest::Method,
        conversation_id: &str,
        base_revision: Option<u64>,
        data: Option<&Value>,
    ) -> Result<PushOutcome> {
        let path = format!("/sync/conversations/{conversation_id}");
        let resp = self
            .request(&client(), method.clone(), &path)
            .json(&PushBodyWire {
                base_revision,
                data,
            })
            .send()?;

        let status = resp.status();
        let text = resp.text().unwrap_or_default();

        if status.is_success() {
            let parsed: WriteResponseWire = serde_json::from_str(&text)?;
            return Ok(PushOutcome::Ack {
                revision: parsed.revision,
            });
        }
        if status.as_u16() == 409 {
            let parsed: ConflictResponseWire = serde_json::from_str(&text)
                .map_err(|_| anyhow!("sync push failed: HTTP {status} {text}"))?;
            return Ok(PushOutcome::Conflict {
                revision: parsed.revision,
                deleted: parsed.deleted,
            });
        }
        Err(anyhow!("sync {method} failed: HTTP {status} {text}"))
    }
}

impl SyncTransport for HttpTransport {
    fn list_conversations(&self) -> Result<Vec<ConversationMeta>> {
        let resp = self
            .request(&client(), reqwest::Method::GET, "/sync/conversations")
            .send()?;

        let status = resp.status();
        let text = resp.text().unwrap_or_default();
        if !status.is_success() {
            return Err(anyhow!("sync list failed: HTTP {status} {text}"));
        }

        let parsed: ListResponseWire = serde_json::from_str(&text)?;
        Ok(parsed
            .items
            .into_iter()
            .map(|item| ConversationMeta {
                conversation_id: item.conversation_id,
                revision: item.revision,
                deleted: item.deleted,
                updated_at_ms: item.updated_at,
            })
            .collect())
    }

    fn get_conversation(&self, conversation_id: &str) -> Result<Option<RemoteConversation>> {
        let path = format!("/sync/conversations/{conversation_id}");
        let resp = self
            .request(&client(), reqwest::Method::GET, &path)
            .send()?;

        let status = resp.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        let text = resp.text().unwrap_or_default();
        if !status.is_success() {
            return Err(anyhow!("sync get failed: HTTP {status} {text}"));
        }

        let parsed: GetResponseWire = serde_json::from_str(&text)?;
        Ok(Some(RemoteConversation {
            conversation_id: parsed.conversation_id,
            revision: parsed.revision,
            deleted: parsed.deleted,
            data: match parsed.data {
                Value::Null => None,
                data => Some(data),
            },
        }))
    }

    fn upsert_conversation(
        &self,
        conversation_id: &str,
        base_revision: Option<u64>,
        data: &Value,
    ) -> Result<PushOutcome> {
        self.push(
            reqwest::Method::PUT,
            conversation_id,
            base_revision,
            Some(data),
        )
    }

    fn delete_conversation(
        &self,
        conversation_id: &str,
        base_revision: Option<u64>,
    ) -> Result<PushOutcome> {
        self.push(reqwest::Method::DELETE, conversation_id, base_revision, None)
    }

    fn subscribe_events(&self) -> Result<EventSubscription> {
        let resp = self
            .request(&events_client(), reqwest::Method::GET, "/sync/events")
            .header(header::ACCEPT, "text/event-stream")
            .send()?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().unwrap_or_default();
            return Err(anyhow!("sync events failed: HTTP {status} {text}"));
        }

        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = std::sync::mpsc::channel();
        let thread_stop = Arc::clone(&stop);
        thread::spawn(move || read_event_stream(resp, tx, thread_stop));
        Ok(EventSubscription::new(rx, stop))
    }
}

/// Line loop over the server-sent-events framing: `event:`/`data:` pairs
/// flushed on blank lines, comment lines ignored.
fn read_event_stream(
    reader: impl std::io::Read,
    tx: std::sync::mpsc::Sender<TransportEvent>,
    stop: Arc<AtomicBool>,
) {
    let mut buf_reader = BufReader::new(reader);
    let mut line = String::new();
    let mut event_type: Option<String> = None;
    let mut data_lines: Vec<String> = Vec::new();

    loop {
        if stop.load(Ordering::Relaxed) {
            return;
        }
        line.clear();
        match buf_reader.read_line(&mut line) {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }

        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            let payload = data_lines.join("\n");
            let dispatched = dispatch_event(event_type.as_deref(), &payload, &tx);
            data_lines.clear();
            event_type = None;
            if !dispatched {
                return;
            }
            continue;
        }
        if trimmed.starts_with(':') {
            continue;
        }
        if let Some(v) = trimmed.strip_prefix("event:") {
            event_type = Some(v.trim().to_string());
            continue;
        }
        if let Some(v) = trimmed.strip_prefix("data:") {
            data_lines.push(v.trim_start().to_string());
            continue;
        }
        // `retry:` and any unknown field are advisory; skip them.
    }
}

fn dispatch_event(
    event_type: Option<&str>,
    payload: &str,
    tx: &std::sync::mpsc::Sender<TransportEvent>,
) -> bool {
    match event_type {
        Some("ready") => tx.send(TransportEvent::Ready).is_ok(),
        Some("conversation_changed") => {
            match serde_json::from_str::<ChangeEventWire>(payload) {
                Ok(parsed) => tx
                    .send(TransportEvent::Changed(RemoteChange {
                        conversation_id: parsed.conversation_id,
                        revision: parsed.revision,
                        deleted: parsed.deleted,
                    }))
                    .is_ok(),
                Err(e) => {
                    tracing::debug!("unparseable conversation_changed event: {e}");
                    true
                }
            }
        }
        Some("close") => {
            let _ = tx.send(TransportEvent::Closed);
            false
        }
        // Keep-alives and empty flushes.
        _ => true,
    }
}
