//! Serial API function identifiers

use std::fmt;

use bitflags::bitflags;

use crate::error::{Error, Result};

/// Frame direction byte
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Unsolicited frame or command sent to the controller
    Request = 0x00,

    /// Synchronous answer to a request
    Response = 0x01,
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(Self::Request),
            0x01 => Ok(Self::Response),
            _ => Err(Error::InvalidMessageType(value)),
        }
    }
}

/// Serial API function codes
///
/// Only the functions used by the driver are listed. Incoming frames with
/// other codes are reported through [`Error::UnknownFunction`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Function {
    // Controller / serial API
    SerialApiGetInitData = 0x02,
    ApplicationCommandHandler = 0x04,
    GetControllerCapabilities = 0x05,
    SerialApiGetCapabilities = 0x07,
    SerialApiSoftReset = 0x08,

    // Network
    SendData = 0x13,
    GetVersion = 0x15,
    MemoryGetId = 0x20,
    GetNodeProtocolInfo = 0x41,
    ReplicationCommandComplete = 0x44,
    ReplicationSendData = 0x45,
    RequestNodeNeighborUpdate = 0x48,
    ApplicationUpdate = 0x49,
    RequestNodeInfo = 0x60,
    IsFailedNode = 0x62,
    GetRoutingInfo = 0x80,
}

impl Function {
    /// Get function name
    pub fn name(self) -> &'static str {
        match self {
            Self::SerialApiGetInitData => "FUNC_ID_SERIAL_API_GET_INIT_DATA",
            Self::ApplicationCommandHandler => "FUNC_ID_APPLICATION_COMMAND_HANDLER",
            Self::GetControllerCapabilities => "FUNC_ID_ZW_GET_CONTROLLER_CAPABILITIES",
            Self::SerialApiGetCapabilities => "FUNC_ID_SERIAL_API_GET_CAPABILITIES",
            Self::SerialApiSoftReset => "FUNC_ID_SERIAL_API_SOFT_RESET",
            Self::SendData => "FUNC_ID_ZW_SEND_DATA",
            Self::GetVersion => "FUNC_ID_ZW_GET_VERSION",
            Self::MemoryGetId => "FUNC_ID_ZW_MEMORY_GET_ID",
            Self::GetNodeProtocolInfo => "FUNC_ID_ZW_GET_NODE_PROTOCOL_INFO",
            Self::ReplicationCommandComplete => "FUNC_ID_ZW_REPLICATION_COMMAND_COMPLETE",
            Self::ReplicationSendData => "FUNC_ID_ZW_REPLICATION_SEND_DATA",
            Self::RequestNodeNeighborUpdate => "FUNC_ID_ZW_REQUEST_NODE_NEIGHBOR_UPDATE",
            Self::ApplicationUpdate => "FUNC_ID_ZW_APPLICATION_UPDATE",
            Self::RequestNodeInfo => "FUNC_ID_ZW_REQUEST_NODE_INFO",
            Self::IsFailedNode => "FUNC_ID_ZW_IS_FAILED_NODE_ID",
            Self::GetRoutingInfo => "FUNC_ID_ZW_GET_ROUTING_INFO",
        }
    }

    /// Whether the controller answers this function with a callback request
    /// carrying our callback id
    pub fn uses_callback(self) -> bool {
        matches!(self, Self::SendData | Self::ReplicationSendData)
    }
}

impl From<Function> for u8 {
    fn from(func: Function) -> u8 {
        func as u8
    }
}

impl TryFrom<u8> for Function {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x02 => Ok(Self::SerialApiGetInitData),
            0x04 => Ok(Self::ApplicationCommandHandler),
            0x05 => Ok(Self::GetControllerCapabilities),
            0x07 => Ok(Self::SerialApiGetCapabilities),
            0x08 => Ok(Self::SerialApiSoftReset),
            0x13 => Ok(Self::SendData),
            0x15 => Ok(Self::GetVersion),
            0x20 => Ok(Self::MemoryGetId),
            0x41 => Ok(Self::GetNodeProtocolInfo),
            0x44 => Ok(Self::ReplicationCommandComplete),
            0x45 => Ok(Self::ReplicationSendData),
            0x48 => Ok(Self::RequestNodeNeighborUpdate),
            0x49 => Ok(Self::ApplicationUpdate),
            0x60 => Ok(Self::RequestNodeInfo),
            0x62 => Ok(Self::IsFailedNode),
            0x80 => Ok(Self::GetRoutingInfo),
            _ => Err(Error::UnknownFunction(value)),
        }
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(0x{:02X})", self.name(), *self as u8)
    }
}

bitflags! {
    /// Transmit options appended to every SendData frame
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TransmitOptions: u8 {
        const ACK = 0x01;
        const LOW_POWER = 0x02;
        const AUTO_ROUTE = 0x04;
        const NO_ROUTE = 0x10;
        const EXPLORE = 0x20;
    }
}

impl Default for TransmitOptions {
    fn default() -> Self {
        Self::ACK | Self::AUTO_ROUTE | Self::EXPLORE
    }
}
