//! Wire format of the virtual-games proxy.
//!
//! Every request is a JSON envelope
//! `{type: "REQUEST", xs, ts, req: {method, query, headers, resource, basePath, host[, body]}}`
//! and every response comes back as `{xs, res: {statusCode, validResponse, resource, body}}`.
//! `xs` is the per-socket sequence number used to correlate the two.

use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub const BASE_PATH: &str = "/api/client/v0.1";

/// Remote resources addressed through the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Login,
    Sync,
    Events,
    Results,
    History,
    Stats,
    Tickets,
    TicketsFindById,
}

impl Resource {
    pub fn path(self) -> &'static str {
        match self {
            Resource::Login => "/session/login",
            Resource::Sync => "/session/sync",
            Resource::Events => "/eventBlocks/event/data",
            Resource::Results => "/eventBlocks/event/result",
            Resource::History => "/eventBlocks/history",
            Resource::Stats => "/eventBlocks/stats",
            Resource::Tickets => "/tickets/send",
            Resource::TicketsFindById => "/tickets/findById",
        }
    }

    pub fn from_path(path: &str) -> Option<Self> {
        [
            Resource::Login,
            Resource::Sync,
            Resource::Events,
            Resource::Results,
            Resource::History,
            Resource::Stats,
            Resource::Tickets,
            Resource::TicketsFindById,
        ]
        .into_iter()
        .find(|r| r.path() == path)
    }
}

/// A request payload: queries go out as GET, bodies as POST.
#[derive(Debug, Clone)]
pub enum Payload {
    Query(Value),
    Body(Value),
}

#[derive(Debug, Serialize)]
pub struct RequestEnvelope {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub xs: u64,
    pub ts: i64,
    pub req: RequestSpec,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSpec {
    pub method: &'static str,
    pub query: Value,
    pub headers: RequestHeaders,
    pub resource: &'static str,
    pub base_path: &'static str,
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct RequestHeaders {
    #[serde(rename = "Content-Type")]
    pub content_type: &'static str,
    #[serde(rename = "clientId", skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl RequestEnvelope {
    pub fn new(xs: u64, resource: Resource, payload: Payload, client_id: &str, host: &str) -> Self {
        let (method, query, body) = match payload {
            Payload::Query(q) => ("GET", q, None),
            Payload::Body(b) => ("POST", Value::Object(Default::default()), Some(b)),
        };
        let client_id = if resource == Resource::Login {
            None
        } else {
            Some(client_id.to_string())
        };
        RequestEnvelope {
            kind: "REQUEST",
            xs,
            ts: Utc::now().timestamp_millis(),
            req: RequestSpec {
                method,
                query,
                headers: RequestHeaders {
                    content_type: "application/json",
                    client_id,
                },
                resource: resource.path(),
                base_path: BASE_PATH,
                host: host.to_string(),
                body,
            },
        }
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone)]
pub struct Response {
    pub xs: Option<u64>,
    pub resource: Option<Resource>,
    pub status_code: Option<u16>,
    pub valid: bool,
    pub body: Value,
}

#[derive(Debug, Deserialize)]
struct ResponseEnvelope {
    #[serde(default)]
    xs: Option<i64>,
    res: ResponseSpec,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseSpec {
    #[serde(default)]
    status_code: Option<u16>,
    #[serde(default)]
    valid_response: bool,
    #[serde(default)]
    resource: Option<String>,
    #[serde(default)]
    body: Value,
}

/// Decode a text frame. Frames that are not response envelopes yield `None`.
pub fn parse_response(text: &str) -> Option<Response> {
    let envelope: ResponseEnvelope = serde_json::from_str(text).ok()?;
    Some(Response {
        xs: envelope.xs.and_then(|x| u64::try_from(x).ok()),
        resource: envelope
            .res
            .resource
            .as_deref()
            .and_then(Resource::from_path),
        status_code: envelope.res.status_code,
        valid: envelope.res.valid_response,
        body: envelope.res.body,
    })
}

/// `timeSend` field of a ticket: UTC with millisecond precision and a `Z` suffix.
pub fn ticket_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

// ── Event block payloads ─────────────────────────────────────────────────────

/// One block of simulated matches (a league round), as returned by the
/// events, results and history resources.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventBlock {
    pub e_block_id: u64,
    /// Absent from some result payloads.
    #[serde(default)]
    pub data: BlockData,
    #[serde(default)]
    pub event_time: Option<Value>,
    #[serde(default)]
    pub events: Vec<EventEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockData {
    pub league_id: u32,
    pub match_day: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEntry {
    pub event_id: u64,
    #[serde(default)]
    pub data: EventData,
    #[serde(default)]
    pub result: Option<EventResult>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventData {
    #[serde(default)]
    pub participants: Vec<Value>,
    #[serde(default, deserialize_with = "de_odds")]
    pub odd_values: Vec<f64>,
    #[serde(default)]
    pub stats: Option<Value>,
}

impl EventData {
    /// Home and away fifa codes.
    pub fn teams(&self) -> Option<(String, String)> {
        let home = participant_code(self.participants.first()?)?;
        let away = participant_code(self.participants.get(1)?)?;
        Some((home, away))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventResult {
    #[serde(default, deserialize_with = "de_lenient_strings")]
    pub won_markets: Vec<String>,
    #[serde(default)]
    pub data: ResultData,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultData {
    #[serde(default, rename = "videoURL")]
    pub video_url: Option<String>,
    #[serde(default, deserialize_with = "de_lenient_strings")]
    pub half_lost_markets: Vec<String>,
    #[serde(default, deserialize_with = "de_lenient_strings")]
    pub half_won_markets: Vec<String>,
    #[serde(default, deserialize_with = "de_lenient_strings")]
    pub refund_markets: Vec<String>,
}

impl ResultData {
    /// Team ids embedded in the replay URL (`.../{home_id}/{away_id}/...`).
    pub fn video_team_ids(&self) -> Option<(u64, u64)> {
        let parts: Vec<&str> = self.video_url.as_deref()?.split('/').collect();
        let home = parts.get(4)?.parse().ok()?;
        let away = parts.get(5)?.parse().ok()?;
        Some((home, away))
    }
}

pub fn participant_code(participant: &Value) -> Option<String> {
    participant
        .get("fifaCode")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

pub fn participant_id(participant: &Value) -> Option<u64> {
    participant.get("id").and_then(|v| {
        v.as_u64()
            .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
    })
}

fn de_odds<'de, D>(deserializer: D) -> Result<Vec<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<Vec<Value>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .iter()
        .map(|v| {
            v.as_f64()
                .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
                .unwrap_or(0.0)
        })
        .collect())
}

fn de_lenient_strings<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<Vec<Value>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .filter_map(|v| match v {
            Value::String(s) => Some(s),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .collect())
}
