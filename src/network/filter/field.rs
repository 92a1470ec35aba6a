use super::{check_balanced, Filter};
use crate::error::{DivertError, Result};
use crate::network::types::{Event, Layer, Protocol};
use std::borrow::Cow;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::ops::Not;

/// A named field of the driver's filter language.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Field(Cow<'static, str>);

/// A literal on the right-hand side of a comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Integer(i128),
    Bool(bool),
    Protocol(Protocol),
    Event(Event),
    Layer(Layer),
    Address(IpAddr),
    /// Rendered verbatim. Built through [`Value::raw`].
    #[non_exhaustive]
    Raw(String),
}

impl Value {
    /// Text the driver understands but this crate has no symbol for.
    ///
    /// # Errors
    ///
    /// Returns `ArgumentInvalid` if the parentheses in `text` are unbalanced,
    /// since the comparison could then never be grouped correctly.
    pub fn raw(text: impl Into<String>) -> Result<Self> {
        let text = text.into();
        check_balanced("value", &text)?;
        Ok(Self::Raw(text))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(value) => write!(f, "{value}"),
            Self::Bool(true) => f.write_str("TRUE"),
            Self::Bool(false) => f.write_str("FALSE"),
            Self::Protocol(protocol) => write!(f, "{protocol}"),
            Self::Event(event) => f.write_str(event.macro_name()),
            Self::Layer(layer) => f.write_str(layer.macro_name()),
            Self::Address(address) => write!(f, "{address}"),
            Self::Raw(text) => f.write_str(text),
        }
    }
}

macro_rules! integer_values {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Value {
            fn from(value: $ty) -> Self {
                Self::Integer(i128::from(value))
            }
        })*
    };
}

integer_values!(u8, u16, u32, u64, i8, i16, i32, i64);

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Protocol> for Value {
    fn from(value: Protocol) -> Self {
        Self::Protocol(value)
    }
}

impl From<Event> for Value {
    fn from(value: Event) -> Self {
        Self::Event(value)
    }
}

impl From<Layer> for Value {
    fn from(value: Layer) -> Self {
        Self::Layer(value)
    }
}

impl From<IpAddr> for Value {
    fn from(value: IpAddr) -> Self {
        Self::Address(value)
    }
}

impl From<Ipv4Addr> for Value {
    fn from(value: Ipv4Addr) -> Self {
        Self::Address(IpAddr::V4(value))
    }
}

impl From<Ipv6Addr> for Value {
    fn from(value: Ipv6Addr) -> Self {
        Self::Address(IpAddr::V6(value))
    }
}

impl TryFrom<&str> for Value {
    type Error = DivertError;

    fn try_from(value: &str) -> Result<Self> {
        Self::raw(value)
    }
}

impl TryFrom<String> for Value {
    type Error = DivertError;

    fn try_from(value: String) -> Result<Self> {
        Self::raw(value)
    }
}

impl Field {
    pub const ZERO: Field = Field::named("zero");
    pub const TIMESTAMP: Field = Field::named("timestamp");
    pub const EVENT: Field = Field::named("event");
    pub const OUTBOUND: Field = Field::named("outbound");
    pub const INBOUND: Field = Field::named("inbound");
    pub const INTERFACE_INDEX: Field = Field::named("ifIdx");
    pub const SUB_INTERFACE_INDEX: Field = Field::named("subIfIdx");
    pub const LOOPBACK: Field = Field::named("loopback");
    pub const IMPOSTOR: Field = Field::named("impostor");
    pub const FRAGMENT: Field = Field::named("fragment");
    pub const ENDPOINT_ID: Field = Field::named("endpointId");
    pub const PARENT_ENDPOINT_ID: Field = Field::named("parentEndpointId");
    pub const PROCESS_ID: Field = Field::named("processId");
    pub const RANDOM8: Field = Field::named("random8");
    pub const RANDOM16: Field = Field::named("random16");
    pub const RANDOM32: Field = Field::named("random32");
    pub const LAYER: Field = Field::named("layer");
    pub const PRIORITY: Field = Field::named("priority");
    pub const LENGTH: Field = Field::named("length");
    pub const IP: Field = Field::named("ip");
    pub const IPV6: Field = Field::named("ipv6");
    pub const ICMP: Field = Field::named("icmp");
    pub const ICMPV6: Field = Field::named("icmpv6");
    pub const TCP: Field = Field::named("tcp");
    pub const UDP: Field = Field::named("udp");
    pub const PROTOCOL: Field = Field::named("protocol");
    pub const LOCAL_ADDRESS: Field = Field::named("localAddr");
    pub const LOCAL_PORT: Field = Field::named("localPort");
    pub const REMOTE_ADDRESS: Field = Field::named("remoteAddr");
    pub const REMOTE_PORT: Field = Field::named("remotePort");

    /// A field known at compile time.
    pub const fn named(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    /// Any other field, such as `tcp.DstPort`.
    pub fn custom(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    /// The byte at `index` into the packet.
    pub fn packet(index: i32) -> Self {
        Self::custom(format!("packet[{index}]"))
    }

    /// The 16-bit word at byte `index` into the packet.
    pub fn packet16(index: i32) -> Self {
        Self::custom(format!("packet16[{index}]"))
    }

    /// The 32-bit word at byte `index` into the packet.
    pub fn packet32(index: i32) -> Self {
        Self::custom(format!("packet32[{index}]"))
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    pub fn equals(&self, value: impl Into<Value>) -> Filter {
        self.compare("=", value.into())
    }

    pub fn not_equals(&self, value: impl Into<Value>) -> Filter {
        self.compare("!=", value.into())
    }

    pub fn less_than(&self, value: impl Into<Value>) -> Filter {
        self.compare("<", value.into())
    }

    pub fn greater_than(&self, value: impl Into<Value>) -> Filter {
        self.compare(">", value.into())
    }

    pub fn at_most(&self, value: impl Into<Value>) -> Filter {
        self.compare("<=", value.into())
    }

    pub fn at_least(&self, value: impl Into<Value>) -> Filter {
        self.compare(">=", value.into())
    }

    fn compare(&self, operator: &str, value: Value) -> Filter {
        Filter::trusted(format!("{} {operator} {value}", self.0))
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Not for Field {
    type Output = Filter;

    fn not(self) -> Filter {
        Filter::trusted(format!("not {}", self.0))
    }
}
