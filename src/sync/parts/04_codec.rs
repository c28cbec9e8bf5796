// Client-only fields that must never go over the wire: the unsent input
// buffer, the in-flight streaming marker, and the per-message token-count
// cache (recomputed locally).
const TRANSIENT_TOP_LEVEL_FIELDS: &[&str] = &["draft", "stream"];
const TRANSIENT_MESSAGE_FIELDS: &[&str] = &["token_count"];

/// A conversation may be sent to the server iff it is not incognito and has
/// actual content (at least one message or a title). Placeholder empties
/// created by "new conversation" never sync.
pub fn is_sync_eligible(doc: &Value) -> bool {
    if doc.get("incognito").and_then(Value::as_bool).unwrap_or(false) {
        return false;
    }
    let has_messages = doc
        .get("messages")
        .and_then(Value::as_array)
        .is_some_and(|messages| !messages.is_empty());
    let has_title = doc
        .get("title")
        .and_then(Value::as_str)
        .is_some_and(|title| !title.trim().is_empty());
    has_messages || has_title
}

/// Strip transient fields for upload. Idempotent.
pub fn sanitize(doc: &Value) -> Value {
    let mut out = doc.clone();
    if let Some(obj) = out.as_object_mut() {
        for field in TRANSIENT_TOP_LEVEL_FIELDS {
            obj.remove(*field);
        }
        if let Some(messages) = obj.get_mut("messages").and_then(Value::as_array_mut) {
            for message in messages {
                if let Some(message) = message.as_object_mut() {
                    for field in TRANSIENT_MESSAGE_FIELDS {
                        message.remove(*field);
                    }
                }
            }
        }
    }
    out
}

/// Inverse of `sanitize`, applied to pulled blobs before they enter the
/// local store: re-attach the defaults the wire format omits.
pub fn inflate(doc: &Value) -> Value {
    let mut out = doc.clone();
    if let Some(obj) = out.as_object_mut() {
        if !obj.contains_key("messages") {
            obj.insert("messages".to_string(), Value::Array(Vec::new()));
        }
    }
    out
}
