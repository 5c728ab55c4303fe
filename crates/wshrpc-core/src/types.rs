//! Shared protocol vocabulary: command and event names, routing context and the
//! payload types of the well-known commands.
//!
//! Fields that can be filled from the sender's `RpcContext` declare their
//! binding through `ContextBound` (see `context`).

use crate::context::{ContextBound, FieldBinding};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Connection name used for the local machine.
pub const LOCAL_CONN_NAME: &str = "local";

/// Command names.
pub mod command {
    /// Special: issues a route to the caller.
    pub const AUTHENTICATE: &str = "authenticate";
    /// Special: registers a route with the router.
    pub const ANNOUNCE: &str = "announce";
    pub const MESSAGE: &str = "message";
    pub const GET_META: &str = "getmeta";
    pub const SET_META: &str = "setmeta";
    pub const SET_VIEW: &str = "setview";
    pub const CONTROLLER_INPUT: &str = "controllerinput";
    pub const CONTROLLER_RESTART: &str = "controllerrestart";
    pub const FILE_APPEND: &str = "fileappend";
    pub const RESOLVE_IDS: &str = "resolveids";
    pub const CREATE_BLOCK: &str = "createblock";
    pub const DELETE_BLOCK: &str = "deleteblock";
    pub const FILE_WRITE: &str = "filewrite";
    pub const FILE_READ: &str = "fileread";
    pub const EVENT_PUBLISH: &str = "eventpublish";
    pub const EVENT_RECV: &str = "eventrecv";
    pub const EVENT_SUB: &str = "eventsub";
    pub const EVENT_UNSUB: &str = "eventunsub";
    pub const EVENT_UNSUB_ALL: &str = "eventunsuball";
    pub const EVENT_READ_HISTORY: &str = "eventreadhistory";
    pub const STREAM_TEST: &str = "streamtest";
    pub const STREAM_CPU_DATA: &str = "streamcpudata";
    pub const TEST: &str = "test";
    pub const REMOTE_STREAM_FILE: &str = "remotestreamfile";
    pub const REMOTE_FILE_INFO: &str = "remotefileinfo";
}

/// Event names.
pub mod event {
    pub const BLOCK_CLOSE: &str = "blockclose";
    pub const CONN_CHANGE: &str = "connchange";
    pub const SYS_INFO: &str = "sysinfo";
    pub const CONTROLLER_STATUS: &str = "controllerstatus";
}

/// Role of an endpoint, announced during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    ConnServer,
    BlockController,
}

impl ClientType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientType::ConnServer => "connserver",
            ClientType::BlockController => "blockcontroller",
        }
    }

    /// Well-known alias route for an endpoint of this type, if the context
    /// carries the id it is keyed by.
    pub fn alias_route(&self, ctx: &RpcContext) -> Option<String> {
        match self {
            ClientType::BlockController if !ctx.block_id.is_empty() => {
                Some(format!("controller:{}", ctx.block_id))
            }
            ClientType::ConnServer if !ctx.conn.is_empty() => Some(format!("conn:{}", ctx.conn)),
            _ => None,
        }
    }
}

impl std::fmt::Display for ClientType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Ambient addressing context of a route.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcContext {
    #[serde(rename = "ctype", default, skip_serializing_if = "Option::is_none")]
    pub client_type: Option<ClientType>,
    #[serde(rename = "blockid", default, skip_serializing_if = "String::is_empty")]
    pub block_id: String,
    #[serde(rename = "tabid", default, skip_serializing_if = "String::is_empty")]
    pub tab_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub conn: String,
}

impl RpcContext {
    pub fn block_controller(block_id: impl Into<String>) -> Self {
        Self {
            client_type: Some(ClientType::BlockController),
            block_id: block_id.into(),
            ..Self::default()
        }
    }

    pub fn conn_server(conn: impl Into<String>) -> Self {
        Self {
            client_type: Some(ClientType::ConnServer),
            conn: conn.into(),
            ..Self::default()
        }
    }

    pub fn with_tab(mut self, tab_id: impl Into<String>) -> Self {
        self.tab_id = tab_id.into();
        self
    }
}

/// Object type of a block.
pub const OTYPE_BLOCK: &str = "block";

/// Reference to a stored object, `otype:oid` on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ORef {
    pub otype: String,
    pub oid: String,
}

impl ORef {
    pub fn new(otype: impl Into<String>, oid: impl Into<String>) -> Self {
        Self {
            otype: otype.into(),
            oid: oid.into(),
        }
    }

    pub fn block(block_id: impl Into<String>) -> Self {
        Self::new(OTYPE_BLOCK, block_id)
    }

    pub fn is_empty(&self) -> bool {
        self.otype.is_empty() && self.oid.is_empty()
    }
}

impl std::fmt::Display for ORef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return Ok(());
        }
        write!(f, "{}:{}", self.otype, self.oid)
    }
}

impl TryFrom<String> for ORef {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        if s.is_empty() {
            return Ok(ORef::default());
        }
        match s.split_once(':') {
            Some((otype, oid)) if !otype.is_empty() && !oid.is_empty() => Ok(ORef::new(otype, oid)),
            _ => Err(format!("invalid object reference: {:?}", s)),
        }
    }
}

impl From<ORef> for String {
    fn from(oref: ORef) -> Self {
        oref.to_string()
    }
}

/// Free-form metadata map attached to objects.
pub type MetaMapType = Map<String, Value>;

// ============================================================================
// Handshake payloads
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandAuthenticateRtnData {
    #[serde(rename = "routeid")]
    pub route_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandAnnounceData {
    #[serde(rename = "routeid")]
    pub route_id: String,
    #[serde(default)]
    pub ctx: RpcContext,
}

// ============================================================================
// Block and object payloads
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandMessageData {
    pub oref: ORef,
    pub message: String,
}

impl ContextBound for CommandMessageData {
    const BINDINGS: &'static [FieldBinding] = &[FieldBinding::new("oref", "BlockORef")];
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandGetMetaData {
    pub oref: ORef,
}

impl ContextBound for CommandGetMetaData {
    const BINDINGS: &'static [FieldBinding] = &[FieldBinding::new("oref", "BlockORef")];
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandSetMetaData {
    pub oref: ORef,
    pub meta: MetaMapType,
}

impl ContextBound for CommandSetMetaData {
    const BINDINGS: &'static [FieldBinding] = &[FieldBinding::new("oref", "BlockORef")];
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandResolveIdsData {
    #[serde(rename = "blockid")]
    pub block_id: String,
    pub ids: Vec<String>,
}

impl ContextBound for CommandResolveIdsData {
    const BINDINGS: &'static [FieldBinding] = &[FieldBinding::new("blockid", "BlockId")];
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandResolveIdsRtnData {
    #[serde(rename = "resolvedids")]
    pub resolved_ids: std::collections::HashMap<String, ORef>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandCreateBlockData {
    #[serde(rename = "tabid")]
    pub tab_id: String,
    #[serde(rename = "blockdef", skip_serializing_if = "Option::is_none")]
    pub block_def: Option<Value>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub magnified: bool,
}

impl ContextBound for CommandCreateBlockData {
    const BINDINGS: &'static [FieldBinding] = &[FieldBinding::new("tabid", "TabId")];
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandBlockSetViewData {
    #[serde(rename = "blockid")]
    pub block_id: String,
    pub view: String,
}

impl ContextBound for CommandBlockSetViewData {
    const BINDINGS: &'static [FieldBinding] = &[FieldBinding::new("blockid", "BlockId")];
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandBlockRestartData {
    #[serde(rename = "blockid")]
    pub block_id: String,
}

impl ContextBound for CommandBlockRestartData {
    const BINDINGS: &'static [FieldBinding] = &[FieldBinding::new("blockid", "BlockId")];
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermSize {
    pub rows: u32,
    pub cols: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandBlockInputData {
    #[serde(rename = "blockid")]
    pub block_id: String,
    #[serde(rename = "inputdata64", skip_serializing_if = "String::is_empty")]
    pub input_data64: String,
    #[serde(rename = "signame", skip_serializing_if = "String::is_empty")]
    pub sig_name: String,
    #[serde(rename = "termsize", skip_serializing_if = "Option::is_none")]
    pub term_size: Option<TermSize>,
}

impl ContextBound for CommandBlockInputData {
    const BINDINGS: &'static [FieldBinding] = &[FieldBinding::new("blockid", "BlockId")];
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandFileData {
    #[serde(rename = "zoneid")]
    pub zone_id: String,
    #[serde(rename = "filename")]
    pub file_name: String,
    #[serde(rename = "data64", skip_serializing_if = "String::is_empty")]
    pub data64: String,
}

impl ContextBound for CommandFileData {
    const BINDINGS: &'static [FieldBinding] = &[FieldBinding::new("zoneid", "BlockId")];
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandDeleteBlockData {
    #[serde(rename = "blockid")]
    pub block_id: String,
}

impl ContextBound for CommandDeleteBlockData {
    const BINDINGS: &'static [FieldBinding] = &[FieldBinding::new("blockid", "BlockId")];
}

// ============================================================================
// Event payloads
// ============================================================================

/// A published event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WaveEvent {
    pub event: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sender: String,
    /// Number of instances retained per scope; 0 retains nothing.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub persist: usize,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

fn is_zero(v: &usize) -> bool {
    *v == 0
}

impl WaveEvent {
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            ..Self::default()
        }
    }

    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_persist(mut self, persist: usize) -> Self {
        self.persist = persist;
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }
}

impl ContextBound for WaveEvent {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    pub event: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
    #[serde(rename = "allscopes", default, skip_serializing_if = "std::ops::Not::not")]
    pub all_scopes: bool,
}

impl SubscriptionRequest {
    pub fn all(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            scopes: Vec::new(),
            all_scopes: true,
        }
    }

    pub fn scoped<I, S>(event: impl Into<String>, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            event: event.into(),
            scopes: scopes.into_iter().map(Into::into).collect(),
            all_scopes: false,
        }
    }
}

impl ContextBound for SubscriptionRequest {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEventReadHistoryData {
    pub event: String,
    pub scope: String,
    #[serde(rename = "maxitems")]
    pub max_items: usize,
}

impl ContextBound for CommandEventReadHistoryData {}

// ============================================================================
// Streaming and remote payloads
// ============================================================================

pub const TIME_SERIES_CPU: &str = "cpu";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuDataRequest {
    pub id: String,
    pub count: usize,
}

impl ContextBound for CpuDataRequest {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesData {
    pub ts: i64,
    pub values: std::collections::HashMap<String, f64>,
}

/// File metadata as produced by a file-system collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: String,
    pub dir: String,
    pub name: String,
    #[serde(rename = "notfound", default, skip_serializing_if = "std::ops::Not::not")]
    pub not_found: bool,
    pub size: i64,
    pub mode: u32,
    #[serde(rename = "modestr")]
    pub mode_str: String,
    #[serde(rename = "modtime")]
    pub mod_time: i64,
    #[serde(rename = "isdir", default, skip_serializing_if = "std::ops::Not::not")]
    pub is_dir: bool,
    #[serde(rename = "mimetype", default, skip_serializing_if = "String::is_empty")]
    pub mime_type: String,
    #[serde(rename = "readonly", default, skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRemoteStreamFileData {
    pub path: String,
    #[serde(rename = "byterange", default, skip_serializing_if = "String::is_empty")]
    pub byte_range: String,
}

impl ContextBound for CommandRemoteStreamFileData {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRemoteStreamFileRtnData {
    #[serde(rename = "fileinfo", default, skip_serializing_if = "Vec::is_empty")]
    pub file_info: Vec<FileInfo>,
    #[serde(rename = "data64", default, skip_serializing_if = "String::is_empty")]
    pub data64: String,
}

/// Connection status reported through `connchange` events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnStatus {
    pub status: String,
    pub connection: String,
    pub connected: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}
