//! Bodies exchanged with the supernode. Every key is camelCase on the wire.
use serde::{Deserialize, Serialize};

use crate::{constants::code, piece::Piece};

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct BaseResponse {
    pub code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

impl BaseResponse {
    pub fn new(code: i32, msg: impl Into<String>) -> Self {
        Self { code, msg: Some(msg.into()) }
    }

    pub fn is_success(&self) -> bool {
        self.code == code::SUCCESS
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RegisterRequest {
    pub raw_url: String,
    pub task_url: String,
    pub cid: String,
    pub ip: String,
    pub host_name: String,
    pub port: u16,
    pub path: String,
    pub version: String,
    pub call_system: String,
    /// `key:value` strings.
    pub headers: Vec<String>,
    pub dfdaemon: bool,
    pub insecure: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    pub super_node_ip: String,
}

/// Whether pieces are served framed by the supernode or raw from the
/// source.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CdnSource {
    #[default]
    Supernode,
    Source,
}

impl CdnSource {
    pub fn is_framed(self) -> bool {
        self == Self::Supernode
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Supernode => crate::constants::CDN_SOURCE_SUPERNODE,
            Self::Source => crate::constants::CDN_SOURCE_SOURCE,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RegisterResponseData {
    pub task_id: String,
    pub file_length: i64,
    pub piece_size: i32,
    pub cdn_source: CdnSource,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<RegisterResponseData>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PullPieceTaskRequest {
    pub src_cid: String,
    pub dst_cid: String,
    pub range: String,
    pub result: i32,
    pub status: i32,
    pub task_id: String,
}

impl PullPieceTaskRequest {
    /// Ack `piece` on behalf of `src_cid`.
    pub fn ack(src_cid: impl Into<String>, piece: &Piece) -> Self {
        Self {
            src_cid: src_cid.into(),
            dst_cid: piece.dst_cid.clone(),
            range: piece.range.clone(),
            result: piece.result.code(),
            status: piece.status.code(),
            task_id: piece.task_id.clone(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PullPieceTaskResponse {
    pub code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl PullPieceTaskResponse {
    /// Piece assignments, only for `PeerContinue` with a valid body.
    pub fn continue_data(&self) -> Option<Vec<PieceTask>> {
        if self.code != code::PEER_CONTINUE {
            return None;
        }
        serde_json::from_value(self.data.clone()?).ok()
    }

    /// Only for `PeerFinish` with a valid body.
    pub fn finish_data(&self) -> Option<FinishData> {
        if self.code != code::PEER_FINISH {
            return None;
        }
        serde_json::from_value(self.data.clone()?).ok()
    }
}

/// One piece assignment of a `PeerContinue` response.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PieceTask {
    pub range: String,
    pub piece_num: i32,
    pub piece_size: i32,
    /// `md5` or `md5:len`.
    pub piece_md5: String,
    pub cid: String,
    pub peer_ip: String,
    pub peer_port: u16,
    pub path: String,
    /// In KB/s.
    pub down_link: i64,
}

impl PieceTask {
    pub fn md5(&self) -> &str {
        self.piece_md5.split(':').next().unwrap_or_default()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct FinishData {
    pub md5: String,
    pub file_length: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReportPieceRequest {
    pub task_id: String,
    pub cid: String,
    pub dst_cid: String,
    pub piece_range: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientErrorRequest {
    pub error_type: String,
    pub src_cid: String,
    pub dst_cid: String,
    pub dst_ip: String,
    pub task_id: String,
    pub range: String,
    pub real_md5: String,
    pub expected_md5: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskMetricsRequest {
    pub backsource_reason: String,
    pub call_system: String,
    pub cid: String,
    /// Seconds.
    pub duration: f64,
    pub file_length: i64,
    pub ip: String,
    pub port: u16,
    pub success: bool,
    pub task_id: String,
}
