//! Webhook payload normalization.
//!
//! The upstream gateway has shipped several payload shapes over time: the
//! message may sit at the top level, under `data`, or under `data.messages[0]`,
//! and the sender/message id have moved between `key.*` and flat fields.
//! Everything in here probes all known locations and never assumes one
//! canonical shape. Downstream code only ever sees [`NormalizedMessage`].

use chrono::{DateTime, TimeZone, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum depth when unwrapping `ephemeralMessage` / `viewOnceMessage` envelopes.
const MAX_WRAPPER_DEPTH: usize = 3;

/// Length of the random suffix on synthesized message ids.
const SYNTHETIC_SUFFIX_LEN: usize = 6;

/// Event names that never carry a conversational message.
///
/// Compared after [`normalize_event_name`]. Anything not listed here is
/// treated as a message so that new upstream event types are not silently
/// dropped.
const IGNORED_EVENTS: &[&str] = &[
    "presence.update",
    "connection.update",
    "qrcode.updated",
    "groups.upsert",
    "groups.update",
    "group.participants.update",
    "messages.update",
    "messages.delete",
    "messages.set",
    "send.message",
    "chats.set",
    "chats.upsert",
    "chats.update",
    "chats.delete",
    "contacts.set",
    "contacts.upsert",
    "contacts.update",
    "labels.edit",
    "labels.association",
    "application.startup",
    "call",
];

// ── Normalized types ────────────────────────────────────────────────

/// Dedup key for an inbound event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageIdentity {
    pub value: String,
    /// True when the provider did not supply an id and one was generated.
    pub synthesized: bool,
}

impl MessageIdentity {
    pub fn provided(id: &str) -> Self {
        Self {
            value: id.to_string(),
            synthesized: false,
        }
    }

    /// Build an id from sender + timestamp + random suffix.
    pub fn synthesize(contact_id: &str, sent_at: DateTime<Utc>) -> Self {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(SYNTHETIC_SUFFIX_LEN)
            .map(char::from)
            .collect();
        Self {
            value: format!("{contact_id}-{}-{suffix}", sent_at.timestamp_millis()),
            synthesized: true,
        }
    }
}

impl std::fmt::Display for MessageIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.value)
    }
}

/// Kind of non-text payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
    Document { file_name: Option<String> },
    Audio { voice_note: bool },
    Sticker,
    Location {
        latitude: f64,
        longitude: f64,
        name: Option<String>,
    },
    Contact { display_name: String },
}

/// Tagged union produced once at ingress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageContent {
    Text { body: String },
    Media {
        media: MediaKind,
        caption: Option<String>,
    },
    System { description: String },
}

impl MessageContent {
    /// Text handed to the classifier and agents. Non-text content maps to a
    /// bracketed placeholder; captions win over placeholders.
    pub fn to_text(&self) -> String {
        match self {
            Self::Text { body } => body.clone(),
            Self::Media {
                caption: Some(caption),
                ..
            } if !caption.trim().is_empty() => caption.clone(),
            Self::Media { media, .. } => match media {
                MediaKind::Image => "[image]".to_string(),
                MediaKind::Video => "[video]".to_string(),
                MediaKind::Document { file_name: Some(name) } => format!("[document: {name}]"),
                MediaKind::Document { file_name: None } => "[document]".to_string(),
                MediaKind::Audio { .. } => "[audio message]".to_string(),
                MediaKind::Sticker => "[sticker]".to_string(),
                MediaKind::Location {
                    latitude,
                    longitude,
                    name,
                } => match name {
                    Some(name) => format!("[location: {name} ({latitude:.5}, {longitude:.5})]"),
                    None => format!("[location: {latitude:.5}, {longitude:.5}]"),
                },
                MediaKind::Contact { display_name } => format!("[contact: {display_name}]"),
            },
            Self::System { description } => format!("[{description}]"),
        }
    }

    /// Audio has to be transcribed out of band before agents can use it.
    pub fn needs_transcription(&self) -> bool {
        matches!(
            self,
            Self::Media {
                media: MediaKind::Audio { .. },
                ..
            }
        )
    }

    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Media { media, .. } => match media {
                MediaKind::Image => "image",
                MediaKind::Video => "video",
                MediaKind::Document { .. } => "document",
                MediaKind::Audio { .. } => "audio",
                MediaKind::Sticker => "sticker",
                MediaKind::Location { .. } => "location",
                MediaKind::Contact { .. } => "contact",
            },
            Self::System { .. } => "system",
        }
    }
}

/// A message admitted by the ingress deduplicator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedMessage {
    pub identity: MessageIdentity,
    /// Normalized contact id (digits for phone JIDs).
    pub contact_id: String,
    /// Where replies go: the group for group messages, the contact otherwise.
    pub reply_to: String,
    pub group_id: Option<String>,
    pub push_name: Option<String>,
    pub content: MessageContent,
    /// Flattened text (see [`MessageContent::to_text`]).
    pub text: String,
    /// Provider message type, when reported.
    pub message_type: Option<String>,
    /// Provider timestamp, falling back to arrival time.
    pub sent_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub needs_transcription: bool,
}

impl NormalizedMessage {
    /// A plain text message from `contact`, as if admitted at `at`.
    pub fn from_text(contact: &str, text: &str, at: DateTime<Utc>) -> Self {
        Self {
            identity: MessageIdentity::synthesize(contact, at),
            contact_id: contact.to_string(),
            reply_to: contact.to_string(),
            group_id: None,
            push_name: None,
            content: MessageContent::Text {
                body: text.to_string(),
            },
            text: text.to_string(),
            message_type: None,
            sent_at: at,
            received_at: at,
            needs_transcription: false,
        }
    }
}

// ── Event classification ────────────────────────────────────────────

/// Lower-case and unify separators: `MESSAGES_UPSERT` → `messages.upsert`.
pub fn normalize_event_name(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == '_' || c == '-' { '.' } else { c })
        .collect()
}

/// Event name from any of the known fields, if present.
pub fn event_name(payload: &Value) -> Option<String> {
    ["event", "eventType", "event_type", "type"]
        .iter()
        .find_map(|k| payload.get(*k).and_then(Value::as_str))
        .map(normalize_event_name)
}

/// True if the event is on the deny-list. Unknown events are messages.
pub fn is_ignorable_event(name: &str) -> bool {
    IGNORED_EVENTS.contains(&name)
}

// ── Field probing ───────────────────────────────────────────────────

/// Locate the object that describes the message itself.
pub fn message_root(payload: &Value) -> Option<&Value> {
    let data = payload.get("data").unwrap_or(payload);
    let root = if let Some(first) = data
        .get("messages")
        .and_then(Value::as_array)
        .and_then(|a| a.first())
    {
        first
    } else if let Some(first) = data.as_array().and_then(|a| a.first()) {
        first
    } else {
        data
    };
    root.is_object().then_some(root)
}

/// Raw addressing fields probed from a message root.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    pub remote_jid: Option<String>,
    pub participant: Option<String>,
    pub from_me: Option<bool>,
    pub message_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub push_name: Option<String>,
    pub message_type: Option<String>,
}

impl Envelope {
    pub fn probe(payload: &Value, root: &Value) -> Self {
        let key = root.get("key").filter(|k| k.is_object());
        let from_key = |field: &str| key.and_then(|k| k.get(field));

        Self {
            remote_jid: first_str([
                from_key("remoteJid"),
                root.get("remoteJid"),
                root.get("chatId"),
                root.get("from"),
            ]),
            participant: first_str([
                from_key("participant"),
                root.get("participant"),
                root.get("author"),
            ]),
            from_me: [from_key("fromMe"), root.get("fromMe"), root.get("from_me")]
                .into_iter()
                .flatten()
                .find_map(as_flag),
            message_id: first_str([
                from_key("id"),
                root.get("id"),
                root.get("messageId"),
                root.get("message_id"),
                payload.get("messageId"),
            ]),
            timestamp: [
                root.get("messageTimestamp"),
                root.get("timestamp"),
                root.get("t"),
            ]
            .into_iter()
            .flatten()
            .find_map(as_timestamp),
            push_name: first_str([
                root.get("pushName"),
                root.get("notifyName"),
                root.get("senderName"),
            ]),
            message_type: first_str([root.get("messageType"), root.get("type")]),
        }
    }

    pub fn is_group(&self) -> bool {
        self.remote_jid
            .as_deref()
            .is_some_and(|jid| jid.ends_with("@g.us"))
    }
}

fn first_str<'a, const N: usize>(candidates: [Option<&'a Value>; N]) -> Option<String> {
    candidates.into_iter().flatten().find_map(|v| match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn as_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        Value::Number(n) => n.as_i64().map(|v| v != 0),
        _ => None,
    }
}

/// Accept seconds or milliseconds, as a number or a numeric string.
fn as_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let raw = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        // Long-encoded protobuf timestamps arrive as {"low": .., "high": .., "unsigned": ..}
        Value::Object(map) => map.get("low").and_then(Value::as_i64),
        _ => None,
    }?;
    if raw <= 0 {
        return None;
    }
    if raw > 1_000_000_000_000 {
        Utc.timestamp_millis_opt(raw).single()
    } else {
        Utc.timestamp_opt(raw, 0).single()
    }
}

// ── Sender resolution ───────────────────────────────────────────────

/// Who sent the message, resolved from the envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sender {
    Contact(String),
    SelfOriginated,
    Missing,
}

/// Resolve the true sender.
///
/// Group messages are attributed to the participant; `remoteJid` is the
/// group itself. Direct messages are attributed to `remoteJid`, but only
/// when the echo flag is false: with `fromMe = true` the remote party is
/// the *recipient* of our own message. The resolved id is compared against
/// the bot's identities; top-level fields such as the instance owner are
/// never used for this comparison.
pub fn resolve_sender(envelope: &Envelope, own_ids: &[String]) -> Sender {
    if envelope.from_me == Some(true) {
        return Sender::SelfOriginated;
    }

    let raw = if envelope.is_group() {
        envelope.participant.as_deref()
    } else {
        envelope.remote_jid.as_deref()
    };

    let Some(contact) = raw.and_then(normalize_contact_id) else {
        return Sender::Missing;
    };

    let is_self = own_ids
        .iter()
        .filter_map(|id| normalize_contact_id(id))
        .any(|own| own == contact);

    if is_self {
        Sender::SelfOriginated
    } else {
        Sender::Contact(contact)
    }
}

/// Normalize a contact id: strip the `@server` suffix, the `:device`
/// suffix and a leading `+`, and lower-case what remains.
///
/// `"+5511999990000:12@s.whatsapp.net"` → `"5511999990000"`.
pub fn normalize_contact_id(raw: &str) -> Option<String> {
    let user = raw.trim().split('@').next().unwrap_or_default();
    let user = user.split(':').next().unwrap_or_default();
    let user = user.trim_start_matches('+').trim().to_lowercase();
    (!user.is_empty()).then_some(user)
}

// ── Content extraction ──────────────────────────────────────────────

/// Extract content from a message root. Never fails: unknown shapes map to
/// a system placeholder.
pub fn extract_content(root: &Value) -> MessageContent {
    if let Some(message) = root.get("message").filter(|m| m.is_object()) {
        return extract_from_message(message, 0);
    }
    // Flat shapes: {"body": "..."} / {"text": "..."} / {"text": {"body": "..."}}
    let flat = [
        root.get("body"),
        root.get("text").and_then(|t| t.get("body")),
        root.get("text"),
        root.get("content"),
    ]
    .into_iter()
    .flatten()
    .find_map(|v| v.as_str().filter(|s| !s.trim().is_empty()));
    match flat {
        Some(body) => MessageContent::Text {
            body: body.to_string(),
        },
        None => MessageContent::System {
            description: "unsupported message".to_string(),
        },
    }
}

fn extract_from_message(message: &Value, depth: usize) -> MessageContent {
    let str_at = |v: &Value, field: &str| {
        v.get(field)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(String::from)
    };

    if let Some(body) = str_at(message, "conversation") {
        return MessageContent::Text { body };
    }
    if let Some(body) = message
        .get("extendedTextMessage")
        .and_then(|m| str_at(m, "text"))
    {
        return MessageContent::Text { body };
    }

    // Interactive replies carry the chosen option as text.
    for (wrapper, field) in [
        ("buttonsResponseMessage", "selectedDisplayText"),
        ("templateButtonReplyMessage", "selectedDisplayText"),
        ("listResponseMessage", "title"),
    ] {
        if let Some(body) = message.get(wrapper).and_then(|m| str_at(m, field)) {
            return MessageContent::Text { body };
        }
    }

    if let Some(image) = message.get("imageMessage") {
        return MessageContent::Media {
            media: MediaKind::Image,
            caption: str_at(image, "caption"),
        };
    }
    if let Some(video) = message.get("videoMessage") {
        return MessageContent::Media {
            media: MediaKind::Video,
            caption: str_at(video, "caption"),
        };
    }
    let document = message.get("documentMessage").or_else(|| {
        message
            .get("documentWithCaptionMessage")
            .and_then(|m| m.get("message"))
            .and_then(|m| m.get("documentMessage"))
    });
    if let Some(document) = document {
        return MessageContent::Media {
            media: MediaKind::Document {
                file_name: str_at(document, "fileName"),
            },
            caption: str_at(document, "caption"),
        };
    }
    if let Some(audio) = message.get("audioMessage") {
        let voice_note = audio.get("ptt").and_then(as_flag).unwrap_or(false);
        return MessageContent::Media {
            media: MediaKind::Audio { voice_note },
            caption: None,
        };
    }
    if message.get("stickerMessage").is_some() {
        return MessageContent::Media {
            media: MediaKind::Sticker,
            caption: None,
        };
    }
    if let Some(location) = message
        .get("locationMessage")
        .or_else(|| message.get("liveLocationMessage"))
    {
        let coord = |field: &str| location.get(field).and_then(Value::as_f64).unwrap_or(0.0);
        return MessageContent::Media {
            media: MediaKind::Location {
                latitude: coord("degreesLatitude"),
                longitude: coord("degreesLongitude"),
                name: str_at(location, "name").or_else(|| str_at(location, "address")),
            },
            caption: None,
        };
    }
    if let Some(contact) = message.get("contactMessage") {
        return MessageContent::Media {
            media: MediaKind::Contact {
                display_name: str_at(contact, "displayName")
                    .unwrap_or_else(|| "unknown".to_string()),
            },
            caption: None,
        };
    }
    if let Some(contacts) = message.get("contactsArrayMessage") {
        let count = contacts
            .get("contacts")
            .and_then(Value::as_array)
            .map_or(0, Vec::len);
        let display_name =
            str_at(contacts, "displayName").unwrap_or_else(|| format!("{count} contacts"));
        return MessageContent::Media {
            media: MediaKind::Contact { display_name },
            caption: None,
        };
    }
    if message.get("reactionMessage").is_some() {
        return MessageContent::System {
            description: "reaction".to_string(),
        };
    }
    if message.get("protocolMessage").is_some() {
        return MessageContent::System {
            description: "protocol message".to_string(),
        };
    }

    // Disappearing / view-once envelopes wrap the real message.
    if depth < MAX_WRAPPER_DEPTH {
        for wrapper in [
            "ephemeralMessage",
            "viewOnceMessage",
            "viewOnceMessageV2",
            "editedMessage",
        ] {
            if let Some(inner) = message
                .get(wrapper)
                .and_then(|w| w.get("message"))
                .filter(|m| m.is_object())
            {
                return extract_from_message(inner, depth + 1);
            }
        }
    }

    MessageContent::System {
        description: "unsupported message".to_string(),
    }
}
