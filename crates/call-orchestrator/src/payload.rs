//! Join payload and join response wire shapes.
//!
//! The payload is produced by the media engine, serialized here and
//! carried opaquely by the signaling transport; the response comes back
//! the same way. Optional collections are omitted from the JSON entirely
//! when empty.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One DTLS fingerprint of a transport description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub hash: String,
    pub setup: String,
    pub fingerprint: String,
}

/// One negotiated RTP header extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtpExtension {
    pub id: u32,
    pub uri: String,
}

/// RTCP feedback capability of a payload type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackType {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subtype: String,
}

/// One negotiated codec payload type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadType {
    pub id: u32,
    pub name: String,
    pub clockrate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
    #[serde(rename = "rtcp-fbs", default, skip_serializing_if = "Vec::is_empty")]
    pub feedback_types: Vec<FeedbackType>,
}

/// A semantic grouping of video sources (e.g. `SIM`, `FID`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SsrcGroup {
    pub semantics: String,
    pub sources: Vec<u32>,
}

/// The payload sent along with a join request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinPayload {
    pub ufrag: String,
    pub pwd: String,
    pub fingerprints: Vec<Fingerprint>,
    pub ssrc: u32,
    #[serde(
        rename = "rtp-hdrexts",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub rtp_header_extensions: Vec<RtpExtension>,
    #[serde(
        rename = "payload-types",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub payload_types: Vec<PayloadType>,
    #[serde(rename = "ssrc-groups", default, skip_serializing_if = "Vec::is_empty")]
    pub ssrc_groups: Vec<SsrcGroup>,
}

impl JoinPayload {
    /// Serialize for the wire.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// One ICE candidate of the server's transport description.
///
/// All fields are carried as strings on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    #[serde(default)]
    pub port: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub generation: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub component: String,
    #[serde(default)]
    pub foundation: String,
    #[serde(default)]
    pub priority: String,
    #[serde(default)]
    pub ip: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(rename = "tcpType", default, skip_serializing_if = "String::is_empty")]
    pub tcp_type: String,
    #[serde(rename = "relAddr", default, skip_serializing_if = "String::is_empty")]
    pub rel_addr: String,
    #[serde(rename = "relPort", default, skip_serializing_if = "String::is_empty")]
    pub rel_port: String,
}

/// Server transport description from a join response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransportDescription {
    #[serde(default)]
    pub ufrag: String,
    #[serde(default)]
    pub pwd: String,
    #[serde(default)]
    pub fingerprints: Vec<Fingerprint>,
    #[serde(default)]
    pub candidates: Vec<IceCandidate>,
}

/// Video-related fields of a join response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoFields {
    #[serde(default)]
    pub server_sources: Vec<u32>,
    #[serde(
        rename = "payload-types",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub payload_types: Vec<PayloadType>,
    #[serde(
        rename = "rtp-hdrexts",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub rtp_header_extensions: Vec<RtpExtension>,
}

/// The join response carried back from the signaling service.
///
/// `stream: true` means the call is consumed as a broadcast relay and no
/// transport description is present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinResponse {
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<VideoFields>,
}

impl JoinResponse {
    /// Parse a join response from its wire form.
    pub fn parse(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Per-participant video parameters as carried in roster deltas.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoParams {
    #[serde(default)]
    pub endpoint: String,
    #[serde(rename = "ssrc-groups", default, skip_serializing_if = "Vec::is_empty")]
    pub ssrc_groups: Vec<SsrcGroup>,
}

impl VideoParams {
    /// All video source ids of this participant.
    pub fn sources(&self) -> impl Iterator<Item = u32> + '_ {
        self.ssrc_groups
            .iter()
            .flat_map(|group| group.sources.iter().copied())
    }

    /// Whether `ssrc` belongs to this participant's video.
    #[must_use]
    pub fn contains_source(&self, ssrc: u32) -> bool {
        self.sources().any(|source| source == ssrc)
    }
}
