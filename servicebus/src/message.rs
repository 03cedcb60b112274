//! Wire envelopes and addressing.
//!
//! Every broker delivery carries exactly one XML envelope.  Requests look
//! like this (`catgory` is spelled that way on the wire):
//!
//! ```text
//! <?xml version="1.0"?>
//! <event version="1">
//!     <id>EVENT_ID</id>
//!     <token>TOKEN_HEX</token>
//!     <catgory>CATEGORY</catgory>
//!     <service>SERVICE</service>
//!     <params><![CDATA[JSON]]></params>
//! </event>
//! ```
//!
//! and responses like this:
//!
//! ```text
//! <?xml version="1.0"?>
//! <response>
//!     <id>EVENT_ID</id>
//!     <message><![CDATA[TEXT_OR_JSON]]></message>
//! </response>
//! ```
//!
//! The liveness handshake bypasses envelopes entirely: a body of `PING` on a
//! delivery with a reply-to queue is answered with the bare body `PONG`.

use {
    crate::error::{Result, ServiceBusError},
    quick_xml::{escape::escape, events::Event as XmlEvent, Reader},
    serde::de::DeserializeOwned,
    serde_json::Value,
    std::{
        fmt,
        str::FromStr,
        sync::atomic::{AtomicU64, Ordering},
    },
};

/// Envelope protocol version written into the `version` attribute.
pub const PROTOCOL_VERSION: &str = "1";

/// Body of a liveness probe.
pub const PING: &str = "PING";

/// Body of a liveness probe answer.
pub const PONG: &str = "PONG";

static EVENT_ID_SEED: AtomicU64 = AtomicU64::new(0);

/// Allocate the next process-local event id.
pub fn next_event_id() -> u64 {
    EVENT_ID_SEED.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
}

// ── Addressing ──────────────────────────────────────────────────────────────

/// A parsed `"<node>.<category>.<service>"` address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    /// Node (queue) name; used as the routing key.
    pub node: String,
    /// Service category.
    pub category: String,
    /// Service name within the category.
    pub service: String,
}

impl Target {
    /// Parse a dotted triple.  Anything other than exactly three non-empty
    /// parts is rejected before any network I/O happens.
    pub fn parse(target: &str) -> Result<Self> {
        let parts: Vec<&str> = target.split('.').collect();
        match parts.as_slice() {
            [node, category, service]
                if !node.is_empty() && !category.is_empty() && !service.is_empty() =>
            {
                Ok(Self {
                    node: (*node).to_string(),
                    category: (*category).to_string(),
                    service: (*service).to_string(),
                })
            }
            _ => Err(ServiceBusError::Validation(format!(
                "Target not valid: {target:?}"
            ))),
        }
    }

    /// `category.service`, the registry key on the receiving node.
    pub fn service_key(&self) -> String {
        service_key(&self.category, &self.service)
    }
}

impl FromStr for Target {
    type Err = ServiceBusError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.node, self.category, self.service)
    }
}

/// Registry key for a category/service pair.
pub fn service_key(category: &str, service: &str) -> String {
    format!("{category}.{service}")
}

// ── Decoded content ─────────────────────────────────────────────────────────

/// The decoded content of one request envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: String,
    pub category: String,
    pub service: String,
    pub token: String,
    pub params: Value,
    pub version: String,
}

impl Event {
    /// `category.service` for registry lookups.
    pub fn service_key(&self) -> String {
        service_key(&self.category, &self.service)
    }
}

/// The decoded content of one response envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcReply {
    /// Id of the request this answers.
    pub id: String,
    /// Free-form reply text; services often put JSON here.
    pub message: String,
}

impl RpcReply {
    /// Interpret the reply message as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.message)?)
    }
}

// ── Encoding ────────────────────────────────────────────────────────────────

/// Build a request envelope.
pub fn encode_request(
    id: &str,
    token: &str,
    category: &str,
    service: &str,
    params: &Value,
) -> Result<String> {
    let params = serde_json::to_string(params)?;
    Ok(format!(
        "<?xml version=\"1.0\"?>\n\
         <event version=\"{PROTOCOL_VERSION}\">\n    \
         <id>{}</id>\n    \
         <token>{}</token>\n    \
         <catgory>{}</catgory>\n    \
         <service>{}</service>\n    \
         <params>{}</params>\n\
         </event>\n",
        escape(id),
        escape(token),
        escape(category),
        escape(service),
        cdata(&params),
    ))
}

/// Build a response envelope.
pub fn encode_response(id: &str, message: &str) -> String {
    format!(
        "<?xml version=\"1.0\"?>\n\
         <response>\n    \
         <id>{}</id>\n    \
         <message>{}</message>\n\
         </response>\n",
        escape(id),
        cdata(message),
    )
}

/// Wrap `text` in CDATA, splitting any embedded terminator across sections.
fn cdata(text: &str) -> String {
    format!("<![CDATA[{}]]>", text.replace("]]>", "]]]]><![CDATA[>"))
}

// ── Decoding ────────────────────────────────────────────────────────────────

/// Decode a request envelope.
pub fn decode_request(body: &str) -> Result<Event> {
    let doc = Document::parse(body)?;
    if doc.root != "event" {
        return Err(decode_error(format!("unexpected root element <{}>", doc.root)));
    }
    let version = doc
        .version
        .clone()
        .ok_or_else(|| decode_error("missing version attribute"))?;
    let params = doc.child("params")?;
    let params = serde_json::from_str(params.trim())
        .map_err(|e| decode_error(format!("params are not valid JSON: {e}")))?;

    Ok(Event {
        id: doc.child("id")?.trim().to_string(),
        category: doc.child("catgory")?.trim().to_string(),
        service: doc.child("service")?.trim().to_string(),
        token: doc.child("token")?.trim().to_string(),
        params,
        version,
    })
}

/// Decode a response envelope.
pub fn decode_response(body: &str) -> Result<RpcReply> {
    let doc = Document::parse(body)?;
    if doc.root != "response" {
        return Err(decode_error(format!("unexpected root element <{}>", doc.root)));
    }
    Ok(RpcReply {
        id: doc.child("id")?.trim().to_string(),
        message: doc.child("message")?.to_string(),
    })
}

fn decode_error(msg: impl Into<String>) -> ServiceBusError {
    ServiceBusError::Decode(msg.into())
}

/// Root element name, its `version` attribute and the text content of its
/// direct children.
struct Document {
    root: String,
    version: Option<String>,
    children: Vec<(String, String)>,
}

impl Document {
    fn parse(body: &str) -> Result<Self> {
        let mut reader = Reader::from_str(body);
        let mut root: Option<(String, Option<String>)> = None;
        let mut children: Vec<(String, String)> = Vec::new();
        let mut depth = 0usize;

        loop {
            let event = reader
                .read_event()
                .map_err(|e| decode_error(format!("malformed markup: {e}")))?;
            match event {
                XmlEvent::Start(start) => {
                    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                    match depth {
                        0 if root.is_none() => {
                            let version = start
                                .attributes()
                                .flatten()
                                .find(|attr| attr.key.as_ref() == b"version")
                                .map(|attr| String::from_utf8_lossy(&attr.value).into_owned());
                            root = Some((name, version));
                        }
                        0 => return Err(decode_error("multiple root elements")),
                        1 => children.push((name, String::new())),
                        _ => {}
                    }
                    depth = depth.saturating_add(1);
                }
                XmlEvent::Empty(start) => {
                    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                    match depth {
                        0 if root.is_none() => root = Some((name, None)),
                        1 => children.push((name, String::new())),
                        _ => {}
                    }
                }
                XmlEvent::End(_) => {
                    depth = depth.saturating_sub(1);
                }
                XmlEvent::Text(text) if depth == 2 => {
                    let text = text
                        .unescape()
                        .map_err(|e| decode_error(format!("bad text content: {e}")))?;
                    if !text.trim().is_empty() {
                        if let Some((_, content)) = children.last_mut() {
                            content.push_str(&text);
                        }
                    }
                }
                XmlEvent::CData(data) if depth == 2 => {
                    let data = String::from_utf8(data.into_inner().into_owned())
                        .map_err(|e| decode_error(format!("CDATA is not UTF-8: {e}")))?;
                    if let Some((_, content)) = children.last_mut() {
                        content.push_str(&data);
                    }
                }
                XmlEvent::Eof => break,
                _ => {}
            }
        }

        if depth != 0 {
            return Err(decode_error("unexpected end of document"));
        }
        let (root, version) = root.ok_or_else(|| decode_error("empty document"))?;
        Ok(Self {
            root,
            version,
            children,
        })
    }

    fn child(&self, name: &str) -> Result<&str> {
        self.children
            .iter()
            .find(|(child, _)| child == name)
            .map(|(_, content)| content.as_str())
            .ok_or_else(|| decode_error(format!("missing <{name}> element")))
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
