//! Message codes and field identifiers.
//!
//! Values below 0x1000 are reserved for the core protocol; higher codes are
//! custom messages and are surfaced to listeners as-is.

// Session management
pub const CMD_LOGIN: u16 = 0x0001;
pub const CMD_LOGIN_RESPONSE: u16 = 0x0002;
pub const CMD_KEEPALIVE: u16 = 0x0003;
pub const CMD_GET_OBJECTS: u16 = 0x0005;
pub const CMD_OBJECT: u16 = 0x0006;
pub const CMD_OBJECT_LIST_END: u16 = 0x0009;
pub const CMD_OBJECT_UPDATE: u16 = 0x000A;
pub const CMD_EVENTLOG_RECORDS: u16 = 0x000C;
pub const CMD_NOTIFY: u16 = 0x0012;
pub const CMD_EVENT_DB_UPDATE: u16 = 0x0018;
pub const CMD_REQUEST_COMPLETED: u16 = 0x001D;
pub const CMD_LOAD_USER_DB: u16 = 0x001E;
pub const CMD_USER_DATA: u16 = 0x001F;
pub const CMD_GROUP_DATA: u16 = 0x0020;
pub const CMD_USER_DB_EOF: u16 = 0x0021;
pub const CMD_USER_DB_UPDATE: u16 = 0x0027;
pub const CMD_GET_ALL_ALARMS: u16 = 0x0046;
pub const CMD_ALARM_UPDATE: u16 = 0x0049;
pub const CMD_GET_SERVER_INFO: u16 = 0x0067;
pub const CMD_FILE_DATA: u16 = 0x0069;
pub const CMD_ABORT_FILE_TRANSFER: u16 = 0x0072;
pub const CMD_ADM_MESSAGE: u16 = 0x007F;
pub const CMD_REQUEST_SESSION_KEY: u16 = 0x0082;
pub const CMD_ENCRYPTED_MESSAGE: u16 = 0x0083;
pub const CMD_SESSION_KEY: u16 = 0x0084;
pub const CMD_REQUEST_ENCRYPTION: u16 = 0x0085;
pub const CMD_GET_ROUTING_TABLE: u16 = 0x0086;
pub const CMD_CHANGE_SUBSCRIPTION: u16 = 0x008A;
pub const CMD_SYSLOG_RECORDS: u16 = 0x008C;
pub const CMD_JOB_CHANGE_NOTIFICATION: u16 = 0x008D;
pub const CMD_TRAP_LOG_RECORDS: u16 = 0x00A0;
pub const CMD_AUDIT_RECORD: u16 = 0x00CE;
pub const CMD_UPLOAD_FILE: u16 = 0x00DB;
pub const CMD_GET_SERVER_FILE: u16 = 0x00EA;
pub const CMD_GET_TABLE: u16 = 0x00F5;
pub const CMD_GET_SELECTED_OBJECTS: u16 = 0x00F9;
pub const CMD_FILE_MONITORING: u16 = 0x011D;
pub const CMD_CANCEL_FILE_MONITORING: u16 = 0x011E;
pub const CMD_GET_FILE_FINGERPRINT: u16 = 0x0130;
pub const CMD_EXECUTE_SCRIPT: u16 = 0x0140;
pub const CMD_EXECUTE_SCRIPT_UPDATE: u16 = 0x0141;
pub const CMD_STOP_SCRIPT: u16 = 0x0142;
pub const CMD_EXECUTE_TABLE_TOOL: u16 = 0x0143;
pub const CMD_STOP_TABLE_TOOL: u16 = 0x0144;
pub const CMD_REQUEST_AUTH_TOKEN: u16 = 0x0150;
pub const CMD_2FA_PREPARE_CHALLENGE: u16 = 0x0151;
pub const CMD_2FA_VALIDATE_RESPONSE: u16 = 0x0152;
pub const CMD_SETUP_TCP_PROXY: u16 = 0x0160;
pub const CMD_TCP_PROXY_DATA: u16 = 0x0161;
pub const CMD_CLOSE_TCP_PROXY: u16 = 0x0162;
/// Like `CMD_NOTIFY`, but the notification code is used as-is.
pub const CMD_RS_NOTIFY: u16 = 0x0163;

/// First code available for custom (extension) messages.
pub const CUSTOM_MESSAGE_BASE: u16 = 0x1000;

// Field identifiers
pub const VID_LOGIN_NAME: u32 = 1;
pub const VID_PASSWORD: u32 = 2;
pub const VID_OBJECT_ID: u32 = 3;
pub const VID_OBJECT_NAME: u32 = 4;
pub const VID_OBJECT_CLASS: u32 = 5;
pub const VID_IP_ADDRESS: u32 = 8;
pub const VID_FLAGS: u32 = 13;
pub const VID_NAME: u32 = 20;
pub const VID_NOTIFICATION_CODE: u32 = 23;
pub const VID_EVENT_CODE: u32 = 24;
pub const VID_RCC: u32 = 28;
pub const VID_LOCKED_BY: u32 = 29;
pub const VID_IS_DELETED: u32 = 30;
pub const VID_USER_ID: u32 = 35;
pub const VID_UPDATE_TYPE: u32 = 42;
pub const VID_NOTIFICATION_DATA: u32 = 92;
pub const VID_TIMESTAMP: u32 = 94;
pub const VID_SERVER_VERSION: u32 = 121;
pub const VID_SUPPORTED_ENCRYPTION: u32 = 122;
pub const VID_FILE_NAME: u32 = 125;
pub const VID_NUM_OBJECTS: u32 = 138;
pub const VID_OBJECT_LIST: u32 = 139;
pub const VID_SERVER_ID: u32 = 142;
pub const VID_PROTOCOL_VERSION: u32 = 146;
pub const VID_PUBLIC_KEY: u32 = 154;
pub const VID_SESSION_KEY: u32 = 155;
pub const VID_CIPHER: u32 = 156;
pub const VID_KEY_LENGTH: u32 = 157;
pub const VID_SESSION_IV: u32 = 158;
pub const VID_NUM_RECORDS: u32 = 174;
pub const VID_SESSION_ID: u32 = 209;
pub const VID_RECORDS_ORDER: u32 = 210;
pub const VID_GUID: u32 = 222;
pub const VID_IV_LENGTH: u32 = 238;
pub const VID_ERROR_TEXT: u32 = 259;
pub const VID_TIMEZONE: u32 = 308;
pub const VID_JOB_ID: u32 = 331;
pub const VID_FILE_SIZE: u32 = 356;
pub const VID_NODE_ID: u32 = 393;
pub const VID_FILE_DATA: u32 = 460;
pub const VID_ADDITIONAL_INFO: u32 = 600;
pub const VID_AUTH_TYPE: u32 = 601;
pub const VID_CERTIFICATE: u32 = 602;
pub const VID_SIGNATURE: u32 = 603;
pub const VID_CHALLENGE: u32 = 604;
pub const VID_CLIENT_INFO: u32 = 605;
pub const VID_OS_INFO: u32 = 606;
pub const VID_CLIENT_TYPE: u32 = 607;
pub const VID_AUTH_TOKEN: u32 = 608;
pub const VID_2FA_METHOD: u32 = 609;
pub const VID_2FA_METHOD_COUNT: u32 = 610;
pub const VID_2FA_METHOD_LIST_BASE: u32 = 611;
pub const VID_CHALLENGE_TEXT: u32 = 640;
pub const VID_QR_LABEL: u32 = 641;
pub const VID_2FA_RESPONSE: u32 = 642;
pub const VID_TRUSTED_DEVICE_TOKEN: u32 = 643;
pub const VID_TRUST_THIS_DEVICE: u32 = 644;
pub const VID_SERVER_CAPABILITIES: u32 = 645;
pub const VID_TOPIC: u32 = 646;
pub const VID_OPERATION: u32 = 647;
pub const VID_CHANNEL_ID: u32 = 648;
pub const VID_PORT: u32 = 649;
pub const VID_FILE_OFFSET: u32 = 650;
pub const VID_HASH: u32 = 651;
pub const VID_MONITOR_ID: u32 = 652;
pub const VID_ENABLE_COMPRESSION: u32 = 653;
pub const VID_MESSAGE: u32 = 654;
pub const VID_REQUEST_ID: u32 = 655;
pub const VID_USER_SYS_RIGHTS: u32 = 656;
pub const VID_FILE_FOLLOW: u32 = 657;

/// Base field id for records in a streamed batch; each record occupies
/// [`RECORD_FIELD_STRIDE`] consecutive field ids.
pub const VID_RECORD_BASE: u32 = 0x1000_0000;
pub const RECORD_FIELD_STRIDE: u32 = 16;

/// Base field id for object lists in an entity frame.
pub const VID_CHILD_ID_BASE: u32 = 0x2000_0000;

/// Authentication method identifiers.
pub const AUTH_TYPE_PASSWORD: u16 = 0;
pub const AUTH_TYPE_CERTIFICATE: u16 = 1;
pub const AUTH_TYPE_TOKEN: u16 = 3;

/// Server capability bits reported in login response.
pub const CAP_TWO_PHASE_TCP_PROXY: u64 = 0x0001;
pub const CAP_PEER_ASSIGNED_PROXY_ID: u64 = 0x0002;
pub const CAP_FILE_RESUME: u64 = 0x0004;
pub const CAP_COMPRESSION: u64 = 0x0008;

/// Supported cipher bits and identifiers.
pub const CIPHER_CHACHA20_POLY1305: u16 = 6;
pub const SUPPORT_CHACHA20_POLY1305: u32 = 0x40;

/// Returns a human-readable name for well-known message codes.
pub fn message_code_name(code: u16) -> &'static str {
    match code {
        CMD_LOGIN => "CMD_LOGIN",
        CMD_LOGIN_RESPONSE => "CMD_LOGIN_RESPONSE",
        CMD_KEEPALIVE => "CMD_KEEPALIVE",
        CMD_OBJECT => "CMD_OBJECT",
        CMD_OBJECT_UPDATE => "CMD_OBJECT_UPDATE",
        CMD_OBJECT_LIST_END => "CMD_OBJECT_LIST_END",
        CMD_REQUEST_COMPLETED => "CMD_REQUEST_COMPLETED",
        CMD_NOTIFY => "CMD_NOTIFY",
        CMD_FILE_DATA => "CMD_FILE_DATA",
        CMD_ABORT_FILE_TRANSFER => "CMD_ABORT_FILE_TRANSFER",
        CMD_REQUEST_SESSION_KEY => "CMD_REQUEST_SESSION_KEY",
        CMD_SESSION_KEY => "CMD_SESSION_KEY",
        CMD_ENCRYPTED_MESSAGE => "CMD_ENCRYPTED_MESSAGE",
        CMD_TCP_PROXY_DATA => "CMD_TCP_PROXY_DATA",
        CMD_SETUP_TCP_PROXY => "CMD_SETUP_TCP_PROXY",
        CMD_CLOSE_TCP_PROXY => "CMD_CLOSE_TCP_PROXY",
        CMD_CHANGE_SUBSCRIPTION => "CMD_CHANGE_SUBSCRIPTION",
        CMD_FILE_MONITORING => "CMD_FILE_MONITORING",
        CMD_USER_DATA => "CMD_USER_DATA",
        CMD_GROUP_DATA => "CMD_GROUP_DATA",
        CMD_USER_DB_EOF => "CMD_USER_DB_EOF",
        CMD_USER_DB_UPDATE => "CMD_USER_DB_UPDATE",
        CMD_JOB_CHANGE_NOTIFICATION => "CMD_JOB_CHANGE_NOTIFICATION",
        CMD_RS_NOTIFY => "CMD_RS_NOTIFY",
        CMD_ADM_MESSAGE => "CMD_ADM_MESSAGE",
        _ if code >= CUSTOM_MESSAGE_BASE => "CUSTOM",
        _ => "UNKNOWN",
    }
}
