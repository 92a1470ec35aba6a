use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Flags controlling how a handle is opened.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct OpenFlags: u64 {
        /// Copy packets instead of diverting them
        const SNIFF = 0x01;
        /// Silently drop matching packets
        const DROP = 0x02;
        /// Handle is only used for receiving
        const RECV_ONLY = 0x04;
        /// Handle is only used for sending
        const SEND_ONLY = 0x08;
        /// Fail instead of installing the driver
        const NO_INSTALL = 0x10;
        /// Receive IP fragments
        const FRAGMENTS = 0x20;
    }
}

bitflags! {
    /// Checksums to skip when recalculating a packet.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ChecksumFlags: u64 {
        const NO_IP = 0x01;
        const NO_ICMP = 0x02;
        const NO_ICMPV6 = 0x04;
        const NO_TCP = 0x08;
        const NO_UDP = 0x10;
    }
}

/// Which direction of a handle to shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Shutdown {
    Receive = 1,
    Send = 2,
    Both = 3,
}
