//! Plain value types shared by the driver seam, the address model and the filter algebra.

pub mod flags;
pub mod layer;
pub mod param;
pub mod protocol;

pub use flags::{ChecksumFlags, OpenFlags, Shutdown};
pub use layer::{Event, Layer};
pub use param::{Param, Version, MAX_BATCH_SIZE};
pub use protocol::Protocol;
