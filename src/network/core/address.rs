//! The driver's per-packet / per-event metadata record.
//!
//! An [`Address`] has the exact 80-byte layout the driver reads and writes,
//! so slices of it can be handed to the driver directly. The layer-specific
//! payload is only reachable through projections that check the record's
//! layer first.

use crate::error::{InvalidState, Result};
use crate::network::types::{Event, Layer, OpenFlags, Protocol};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Size in bytes of one address record.
pub const ADDRESS_SIZE: usize = 80;

const PAYLOAD_SIZE: usize = 64;

const SNIFFED: u8 = 0x01;
const OUTBOUND: u8 = 0x02;
const LOOPBACK: u8 = 0x04;
const IMPOSTOR: u8 = 0x08;
const IPV6: u8 = 0x10;
const IP_CHECKSUM: u8 = 0x20;
const TCP_CHECKSUM: u8 = 0x40;
const UDP_CHECKSUM: u8 = 0x80;

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    timestamp: i64,
    layer: u8,
    event: u8,
    bits: u8,
    reserved1: u8,
    reserved2: u32,
    payload: [u8; PAYLOAD_SIZE],
}

const _: () = assert!(std::mem::size_of::<Address>() == ADDRESS_SIZE);

impl Default for Address {
    fn default() -> Self {
        Self {
            timestamp: 0,
            layer: Layer::Network as u8,
            event: Event::NetworkPacket as u8,
            bits: 0,
            reserved1: 0,
            reserved2: 0,
            payload: [0; PAYLOAD_SIZE],
        }
    }
}

/// Interface indices of a network or forward layer record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkData {
    pub interface_index: u32,
    pub sub_interface_index: u32,
}

/// Endpoint information of a flow or socket layer record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointData {
    pub endpoint_id: u64,
    pub parent_endpoint_id: u64,
    pub process_id: u32,
    pub local_address: IpAddr,
    pub remote_address: IpAddr,
    pub local_port: u16,
    pub remote_port: u16,
    pub protocol: Protocol,
}

/// Describes the handle that was opened or closed in a reflect layer record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReflectData {
    pub timestamp: i64,
    pub process_id: u32,
    /// `None` if the driver reported a layer this crate does not know.
    pub layer: Option<Layer>,
    pub flags: OpenFlags,
    pub priority: i16,
}

/// Layer-specific payload of an address record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerData {
    Network(NetworkData),
    Flow(EndpointData),
    Socket(EndpointData),
    Reflect(ReflectData),
}

impl Address {
    /// Creates a network layer record for injecting a packet on the given interface.
    pub fn new(interface_index: u32, sub_interface_index: u32) -> Self {
        let mut address = Self::default();
        address.payload[0..4].copy_from_slice(&interface_index.to_le_bytes());
        address.payload[4..8].copy_from_slice(&sub_interface_index.to_le_bytes());
        address
    }

    /// Zeroes the record, leaving a network layer packet record.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Performance counter timestamp of the event.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn layer(&self) -> Option<Layer> {
        Layer::from_raw(u32::from(self.layer))
    }

    pub fn event(&self) -> Option<Event> {
        Event::from_raw(self.event)
    }

    pub fn is_sniffed(&self) -> bool {
        self.bit(SNIFFED)
    }

    pub fn is_outbound(&self) -> bool {
        self.bit(OUTBOUND)
    }

    pub fn set_outbound(&mut self, value: bool) {
        self.set_bit(OUTBOUND, value);
    }

    pub fn is_loopback(&self) -> bool {
        self.bit(LOOPBACK)
    }

    /// Whether the packet was injected by another driver handle.
    pub fn is_impostor(&self) -> bool {
        self.bit(IMPOSTOR)
    }

    pub fn set_impostor(&mut self, value: bool) {
        self.set_bit(IMPOSTOR, value);
    }

    pub fn is_ipv6(&self) -> bool {
        self.bit(IPV6)
    }

    pub fn ip_checksum_valid(&self) -> bool {
        self.bit(IP_CHECKSUM)
    }

    pub fn set_ip_checksum_valid(&mut self, value: bool) {
        self.set_bit(IP_CHECKSUM, value);
    }

    pub fn tcp_checksum_valid(&self) -> bool {
        self.bit(TCP_CHECKSUM)
    }

    pub fn set_tcp_checksum_valid(&mut self, value: bool) {
        self.set_bit(TCP_CHECKSUM, value);
    }

    pub fn udp_checksum_valid(&self) -> bool {
        self.bit(UDP_CHECKSUM)
    }

    pub fn set_udp_checksum_valid(&mut self, value: bool) {
        self.set_bit(UDP_CHECKSUM, value);
    }

    /// Decodes the layer-specific payload.
    ///
    /// Forward layer records project as [`LayerData::Network`].
    ///
    /// # Errors
    ///
    /// Returns `InvalidState::WrongLayer` if the record carries a layer value
    /// the driver does not define.
    pub fn data(&self) -> Result<LayerData> {
        match self.layer() {
            Some(Layer::Network | Layer::Forward) => Ok(LayerData::Network(self.read_network())),
            Some(Layer::Flow) => Ok(LayerData::Flow(self.read_endpoint())),
            Some(Layer::Socket) => Ok(LayerData::Socket(self.read_endpoint())),
            Some(Layer::Reflect) => Ok(LayerData::Reflect(self.read_reflect())),
            None => Err(self.wrong_layer(Layer::Network).into()),
        }
    }

    /// Interface indices. Valid for network and forward layer records.
    pub fn network_data(&self) -> Result<NetworkData> {
        match self.layer() {
            Some(Layer::Network | Layer::Forward) => Ok(self.read_network()),
            _ => Err(self.wrong_layer(Layer::Network).into()),
        }
    }

    pub fn flow_data(&self) -> Result<EndpointData> {
        self.expect_layer(Layer::Flow)?;
        Ok(self.read_endpoint())
    }

    pub fn socket_data(&self) -> Result<EndpointData> {
        self.expect_layer(Layer::Socket)?;
        Ok(self.read_endpoint())
    }

    pub fn reflect_data(&self) -> Result<ReflectData> {
        self.expect_layer(Layer::Reflect)?;
        Ok(self.read_reflect())
    }

    /// Encodes the record in the driver's byte layout.
    pub fn to_bytes(&self) -> [u8; ADDRESS_SIZE] {
        let mut bytes = [0u8; ADDRESS_SIZE];
        bytes[0..8].copy_from_slice(&self.timestamp.to_le_bytes());
        bytes[8] = self.layer;
        bytes[9] = self.event;
        bytes[10] = self.bits;
        bytes[11] = self.reserved1;
        bytes[12..16].copy_from_slice(&self.reserved2.to_le_bytes());
        bytes[16..].copy_from_slice(&self.payload);
        bytes
    }

    /// Decodes a record captured elsewhere, e.g. from a file or another process.
    pub fn from_bytes(bytes: &[u8; ADDRESS_SIZE]) -> Self {
        let mut payload = [0u8; PAYLOAD_SIZE];
        payload.copy_from_slice(&bytes[16..]);
        Self {
            timestamp: i64::from_le_bytes(le_array(&bytes[0..8])),
            layer: bytes[8],
            event: bytes[9],
            bits: bytes[10],
            reserved1: bytes[11],
            reserved2: u32::from_le_bytes(le_array(&bytes[12..16])),
            payload,
        }
    }

    fn bit(&self, mask: u8) -> bool {
        self.bits & mask != 0
    }

    fn set_bit(&mut self, mask: u8, value: bool) {
        if value {
            self.bits |= mask;
        } else {
            self.bits &= !mask;
        }
    }

    fn expect_layer(&self, expected: Layer) -> std::result::Result<(), InvalidState> {
        if self.layer == expected as u8 {
            Ok(())
        } else {
            Err(self.wrong_layer(expected))
        }
    }

    fn wrong_layer(&self, expected: Layer) -> InvalidState {
        InvalidState::WrongLayer {
            actual: self.layer,
            expected,
        }
    }

    fn read_network(&self) -> NetworkData {
        NetworkData {
            interface_index: self.u32_at(0),
            sub_interface_index: self.u32_at(4),
        }
    }

    fn read_endpoint(&self) -> EndpointData {
        EndpointData {
            endpoint_id: u64::from_le_bytes(le_array(&self.payload[0..8])),
            parent_endpoint_id: u64::from_le_bytes(le_array(&self.payload[8..16])),
            process_id: self.u32_at(16),
            local_address: self.ip_at(20),
            remote_address: self.ip_at(36),
            local_port: u16::from_le_bytes(le_array(&self.payload[52..54])),
            remote_port: u16::from_le_bytes(le_array(&self.payload[54..56])),
            protocol: Protocol::from(self.payload[56]),
        }
    }

    fn read_reflect(&self) -> ReflectData {
        ReflectData {
            timestamp: i64::from_le_bytes(le_array(&self.payload[0..8])),
            process_id: self.u32_at(8),
            layer: Layer::from_raw(self.u32_at(12)),
            flags: OpenFlags::from_bits_retain(u64::from_le_bytes(le_array(&self.payload[16..24]))),
            priority: i16::from_le_bytes(le_array(&self.payload[24..26])),
        }
    }

    fn u32_at(&self, offset: usize) -> u32 {
        u32::from_le_bytes(le_array(&self.payload[offset..offset + 4]))
    }

    /// The driver stores addresses as four host-order 32-bit words, least
    /// significant word first, so the 16 bytes read as one little-endian
    /// 128-bit integer. IPv4 addresses occupy the low word.
    fn ip_at(&self, offset: usize) -> IpAddr {
        let raw = u128::from_le_bytes(le_array(&self.payload[offset..offset + 16]));
        if self.is_ipv6() {
            IpAddr::V6(Ipv6Addr::from(raw))
        } else {
            IpAddr::V4(Ipv4Addr::from(raw as u32))
        }
    }
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut array = [0u8; N];
    array.copy_from_slice(bytes);
    array
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Address")
            .field("timestamp", &self.timestamp)
            .field("layer", &self.layer())
            .field("event", &self.event())
            .field("outbound", &self.is_outbound())
            .field("loopback", &self.is_loopback())
            .field("impostor", &self.is_impostor())
            .field("ipv6", &self.is_ipv6())
            .field("data", &self.data().ok())
            .finish()
    }
}
