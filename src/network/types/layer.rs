use serde::{Deserialize, Serialize};

/// The category of events a handle observes.
///
/// The discriminants match the values the driver expects at open time and
/// writes into every [`Address`](crate::network::core::address::Address).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Layer {
    /// Network packets to/from the local machine
    #[default]
    Network = 0,
    /// Network packets passing through the local machine
    Forward = 1,
    /// Network flow established/deleted events
    Flow = 2,
    /// Socket operation events
    Socket = 3,
    /// Driver handle open/close events
    Reflect = 4,
}

impl Layer {
    /// Decodes a raw layer value as written by the driver.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Network),
            1 => Some(Self::Forward),
            2 => Some(Self::Flow),
            3 => Some(Self::Socket),
            4 => Some(Self::Reflect),
            _ => None,
        }
    }

    /// Name of the layer in the driver's filter language.
    pub fn macro_name(self) -> &'static str {
        match self {
            Self::Network => "NETWORK",
            Self::Forward => "NETWORK_FORWARD",
            Self::Flow => "FLOW",
            Self::Socket => "SOCKET",
            Self::Reflect => "REFLECT",
        }
    }
}

/// The kind of event an address record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Event {
    NetworkPacket = 0,
    FlowEstablished = 1,
    FlowDeleted = 2,
    SocketBind = 3,
    SocketConnect = 4,
    SocketListen = 5,
    SocketAccept = 6,
    SocketClose = 7,
    ReflectOpen = 8,
    ReflectClose = 9,
}

impl Event {
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::NetworkPacket,
            1 => Self::FlowEstablished,
            2 => Self::FlowDeleted,
            3 => Self::SocketBind,
            4 => Self::SocketConnect,
            5 => Self::SocketListen,
            6 => Self::SocketAccept,
            7 => Self::SocketClose,
            8 => Self::ReflectOpen,
            9 => Self::ReflectClose,
            _ => return None,
        })
    }

    /// Name of the event in the driver's filter language.
    ///
    /// Socket and reflect close events share the `CLOSE` macro.
    pub fn macro_name(self) -> &'static str {
        match self {
            Self::NetworkPacket => "PACKET",
            Self::FlowEstablished => "ESTABLISHED",
            Self::FlowDeleted => "DELETED",
            Self::SocketBind => "BIND",
            Self::SocketConnect => "CONNECT",
            Self::SocketListen => "LISTEN",
            Self::SocketAccept => "ACCEPT",
            Self::SocketClose | Self::ReflectClose => "CLOSE",
            Self::ReflectOpen => "OPEN",
        }
    }

    /// The layer that produces this event.
    pub fn layer(self) -> Layer {
        match self {
            Self::NetworkPacket => Layer::Network,
            Self::FlowEstablished | Self::FlowDeleted => Layer::Flow,
            Self::SocketBind
            | Self::SocketConnect
            | Self::SocketListen
            | Self::SocketAccept
            | Self::SocketClose => Layer::Socket,
            Self::ReflectOpen | Self::ReflectClose => Layer::Reflect,
        }
    }
}
