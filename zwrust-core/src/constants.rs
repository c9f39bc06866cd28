//! Protocol constants

/// Start of a data frame
pub const SOF: u8 = 0x01;

/// Frame acknowledged
pub const ACK: u8 = 0x06;

/// Frame rejected (checksum error)
pub const NAK: u8 = 0x15;

/// Frame dropped by the controller (collision)
pub const CAN: u8 = 0x18;

/// Broadcast node id
pub const NODE_BROADCAST: u8 = 0xFF;

/// Highest node id on a classic Z-Wave network
pub const MAX_NODES: usize = 232;

/// Bytes of a node bitmap (init data, routing info)
pub const NODE_BITMAP_LEN: usize = 29;

/// Default wait for ACK / response / callback (milliseconds)
pub const RETRY_TIMEOUT_MS: u64 = 10_000;

/// Default send attempts before a message is dropped
pub const MAX_TRIES: u8 = 3;

/// Hard upper bound on configured send attempts
pub const MAX_MAX_TRIES: u8 = 7;

/// Size of the frame buffer (length is a single byte)
pub const MAX_FRAME_SIZE: usize = 256;

/// Transmit completion status (SendData callback)
pub mod transmit_status {
    /// Delivered and acknowledged by the node
    pub const OK: u8 = 0x00;

    /// No ACK from the node (possibly asleep)
    pub const NO_ACK: u8 = 0x01;

    /// Network busy
    pub const FAIL: u8 = 0x02;

    /// Transmission not idle
    pub const NOT_IDLE: u8 = 0x03;

    /// No route available
    pub const NO_ROUTE: u8 = 0x04;
}

/// ZW_APPLICATION_UPDATE status codes
pub mod update_state {
    pub const SUC_ID: u8 = 0x10;
    pub const DELETE_DONE: u8 = 0x20;
    pub const NEW_ID_ASSIGNED: u8 = 0x40;
    pub const ROUTING_PENDING: u8 = 0x80;
    pub const NODE_INFO_REQ_FAILED: u8 = 0x81;
    pub const NODE_INFO_REQ_DONE: u8 = 0x82;
    pub const NODE_INFO_RECEIVED: u8 = 0x84;
}

/// Marker separating supported from controlled classes in a node information frame
pub const COMMAND_CLASS_MARK: u8 = 0xEF;

/// Well-known command class ids
pub mod command_class {
    pub const NO_OPERATION: u8 = 0x00;
    pub const BASIC: u8 = 0x20;
    pub const CONTROLLER_REPLICATION: u8 = 0x21;
    pub const SWITCH_BINARY: u8 = 0x25;
    pub const SWITCH_MULTILEVEL: u8 = 0x26;
    pub const SENSOR_BINARY: u8 = 0x30;
    pub const SENSOR_MULTILEVEL: u8 = 0x31;
    pub const CENTRAL_SCENE: u8 = 0x5B;
    pub const MULTI_INSTANCE: u8 = 0x60;
    pub const CONFIGURATION: u8 = 0x70;
    pub const MANUFACTURER_SPECIFIC: u8 = 0x72;
    pub const NODE_NAMING: u8 = 0x77;
    pub const BATTERY: u8 = 0x80;
    pub const WAKE_UP: u8 = 0x84;
    pub const ASSOCIATION: u8 = 0x85;
    pub const VERSION: u8 = 0x86;
    pub const MULTI_CHANNEL_ASSOCIATION: u8 = 0x8E;
    pub const SECURITY: u8 = 0x98;
}

/// Multi Instance / Multi Channel commands used by frame encapsulation
pub mod multi_instance {
    pub const MULTI_INSTANCE_ENCAP: u8 = 0x06;
    pub const MULTI_CHANNEL_ENCAP: u8 = 0x0D;
}

/// Security command class commands
pub mod security {
    pub const SUPPORTED_GET: u8 = 0x02;
    pub const SUPPORTED_REPORT: u8 = 0x03;
    pub const SCHEME_GET: u8 = 0x04;
    pub const SCHEME_REPORT: u8 = 0x05;
    pub const NETWORK_KEY_SET: u8 = 0x06;
    pub const NETWORK_KEY_VERIFY: u8 = 0x07;
    pub const NONCE_GET: u8 = 0x40;
    pub const NONCE_REPORT: u8 = 0x80;
    pub const MESSAGE_ENCAP: u8 = 0x81;
    pub const MESSAGE_ENCAP_NONCE_GET: u8 = 0xC1;

    /// Lifetime of a nonce we handed out (seconds)
    pub const NONCE_TIMEOUT_SECS: u64 = 10;
}
