//! ICP method numbers and payloads.

use serde::{Deserialize, Serialize};

/* rdp-server → session-manager */
pub const MSG_VERSION_INFO: u32 = 1;
pub const MSG_PING: u32 = 2;
pub const MSG_LOGON_USER: u32 = 3;
pub const MSG_DISCONNECT_USER_SESSION: u32 = 4;
pub const MSG_PROPERTY_BOOL: u32 = 5;
pub const MSG_PROPERTY_NUMBER: u32 = 6;
pub const MSG_PROPERTY_STRING: u32 = 7;
pub const MSG_PROPERTY_BULK: u32 = 8;
pub const MSG_REMOTE_CONTROL_ENDED: u32 = 9;

/* session-manager → rdp-server (OTS API and session control) */
pub const MSG_SWITCH_TO: u32 = 20;
pub const MSG_LOGOFF_USER_SESSION: u32 = 21;
pub const MSG_USER_MESSAGE: u32 = 22;
pub const MSG_VC_OPEN: u32 = 23;
pub const MSG_VC_CLOSE: u32 = 24;
pub const MSG_START_REMOTE_CONTROL: u32 = 25;
pub const MSG_STOP_REMOTE_CONTROL: u32 = 26;

/* session-manager → module launcher */
pub const MSG_MODULE_START: u32 = 100;
pub const MSG_MODULE_STOP: u32 = 101;
pub const MSG_MODULE_CONNECT: u32 = 102;
pub const MSG_MODULE_DISCONNECT: u32 = 103;
pub const MSG_MODULE_GET_CUSTOM_INFO: u32 = 104;
pub const MSG_MODULE_EXIT: u32 = 105;

/* launcher → session-manager (reverse property lookups) */
pub const MSG_LAUNCHER_PROPERTY_BOOL: u32 = 110;
pub const MSG_LAUNCHER_PROPERTY_NUMBER: u32 = 111;
pub const MSG_LAUNCHER_PROPERTY_STRING: u32 = 112;

/// Message numbers at or above this value belong to the session broker
/// pass-through (SBP); their payloads are opaque to the transport.
pub const SBP_TYPE_BASE: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version_major: u32,
    pub version_minor: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingReply {
    pub pong: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogonUser {
    pub connection_id: u32,
    pub username: String,
    pub domain: String,
    pub password: String,
    pub client_hostname: String,
    pub client_address: String,
    pub client_build: u32,
    pub client_product_id: u16,
    pub hardware_id: u32,
    pub protocol: u16,
    pub width: u32,
    pub height: u32,
    pub color_depth: u32,
}

/// Where a logged-on connection should attach, and how to prove itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendProps {
    pub service_endpoint: String,
    /// Sent by the server in its Version message.
    pub server_cookie: String,
    /// Expected back from the backend in the VersionReply.
    pub backend_cookie: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogonUserReply {
    pub props: BackendProps,
    pub max_width: u32,
    pub max_height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectUserSession {
    pub connection_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectUserSessionReply {
    pub disconnected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyGet {
    pub connection_id: u32,
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyBoolReply {
    pub success: bool,
    pub value: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyNumberReply {
    pub success: bool,
    pub value: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyStringReply {
    pub success: bool,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyKind {
    Bool,
    Number,
    String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyBulkRequest {
    pub kind: PropertyKind,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyBulkValue {
    Missing,
    Bool(bool),
    Number(i64),
    String(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyBulk {
    pub connection_id: u32,
    pub requests: Vec<PropertyBulkRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyBulkReply {
    pub results: Vec<PropertyBulkValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteControlEnded {
    pub spy_id: u32,
    pub spied_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchTo {
    pub connection_id: u32,
    pub props: BackendProps,
    pub max_width: u32,
    pub max_height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogoffUserSession {
    pub connection_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMessageCall {
    pub connection_id: u32,
    pub message_type: u32,
    pub style: u32,
    pub timeout: u32,
    pub parameters: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMessageReply {
    pub result: u32,
}

pub const VC_FLAG_DYNAMIC: u32 = 0x1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualChannelOpen {
    pub connection_id: u32,
    pub vc_name: String,
    pub flags: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualChannelOpenReply {
    pub success: bool,
    pub pipe_name: String,
    pub instance: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualChannelClose {
    pub connection_id: u32,
    pub vc_name: String,
    pub instance: u32,
}

pub const REMOTECONTROL_FLAG_DISABLE_KEYBOARD: u32 = 0x1;
pub const REMOTECONTROL_FLAG_DISABLE_MOUSE: u32 = 0x2;
pub const REMOTECONTROL_KBD_HOTKEY_SHIFT: u32 = 0x1;
pub const REMOTECONTROL_KBD_HOTKEY_CTRL: u32 = 0x2;
pub const REMOTECONTROL_KBD_HOTKEY_ALT: u32 = 0x4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartRemoteControl {
    /// The spying connection.
    pub connection_id: u32,
    /// The connection being observed.
    pub target_id: u32,
    pub hot_key_vk: u32,
    pub hot_key_modifiers: u32,
    pub flags: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopRemoteControl {
    pub connection_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericReply {
    pub success: bool,
}

/* module launcher payloads */

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleCall {
    pub session_id: u32,
    pub username: String,
    pub base_config_path: String,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleStartReply {
    pub success: bool,
    pub pipe_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleStringReply {
    pub success: bool,
    pub value: String,
}
