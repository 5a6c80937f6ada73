//! Named constants for the protocols and message kinds carried in
//! frame headers.
//!
//! These constants are shared between the device client and the relay
//! so that wire strings stay in sync without duplicating literals.

// ---------------------------------------------------------------------------
// Protocol discriminators
// ---------------------------------------------------------------------------

/// Interactive shell sessions.
pub const PROTO_SHELL: u16 = 1;

/// File upload/download.
pub const PROTO_FILE_TRANSFER: u16 = 2;

/// Port forwarding (reserved, not implemented).
pub const PROTO_PORT_FORWARD: u16 = 3;

/// Device client control messages.
pub const PROTO_DEVICE_CLIENT: u16 = 4;

/// Whether frames of a protocol are mirrored into session recordings.
pub const fn is_recordable(proto: u16) -> bool {
    proto == PROTO_SHELL
}

// ---------------------------------------------------------------------------
// Shell message kinds
// ---------------------------------------------------------------------------

/// Session establishment, relay -> device.
pub const MSG_NEW_SESSION: &str = "new";

/// Start a shell inside an established session.
pub const MSG_START_SHELL: &str = "start";

/// Stop the session; sent by the relay on close.
pub const MSG_STOP_SESSION: &str = "stop";

/// Terminal data, either direction.
pub const MSG_SHELL_DATA: &str = "shell";

/// Keepalive probe.
pub const MSG_PING: &str = "ping";

/// Keepalive reply.
pub const MSG_PONG: &str = "pong";

/// Protocol-level error, either direction.
pub const MSG_ERROR: &str = "error";

// ---------------------------------------------------------------------------
// File transfer message kinds
// ---------------------------------------------------------------------------

/// Request to read a file from the device.
pub const MSG_GET_FILE: &str = "get_file";

/// Request to write a file onto the device.
pub const MSG_PUT_FILE: &str = "put_file";

/// One chunk of file content; an empty body terminates the transfer.
pub const MSG_FILE_CHUNK: &str = "file_chunk";

/// Positive acknowledgment of a request.
pub const MSG_ACK: &str = "ack";

// ---------------------------------------------------------------------------
// Device client message kinds
// ---------------------------------------------------------------------------

/// Ask the device to poll its update server.
pub const MSG_CHECK_UPDATE: &str = "check-update";

/// Ask the device to submit its inventory.
pub const MSG_SEND_INVENTORY: &str = "send-inventory";

// ---------------------------------------------------------------------------
// Property keys
// ---------------------------------------------------------------------------

pub const PROP_PATH: &str = "path";
pub const PROP_UID: &str = "uid";
pub const PROP_GID: &str = "gid";
pub const PROP_MODE: &str = "mode";
pub const PROP_SIZE: &str = "size";
pub const PROP_OFFSET: &str = "offset";

/// Numeric status carried on `error` frames.
pub const PROP_STATUS: &str = "status";
