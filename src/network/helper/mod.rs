//! Packet and filter helpers.
//!
//! Everything here goes through the driver's own helper entry points, so
//! results match what the driver computes for the packets it hands out.

use crate::error::{DivertError, Result};
use crate::network::core::address::Address;
use crate::network::filter::Filter;
use crate::network::types::{ChecksumFlags, Layer};
use crate::sys::{CompiledFilter, Driver};
use log::{debug, trace};
use std::ffi::{CStr, CString};

fn filter_text(filter: &Filter) -> Result<CString> {
    CString::new(filter.clause())
        .map_err(|_| DivertError::invalid_argument("filter", "contains a NUL byte"))
}

/// Compiles `filter` for `layer` into the driver's object form.
///
/// # Errors
///
/// `FilterRejected` with the driver's message, the byte offset it stopped
/// at and the remaining text from that offset.
pub fn compile_filter<D: Driver>(driver: &D, filter: &Filter, layer: Layer) -> Result<CompiledFilter> {
    let text = filter_text(filter)?;
    match driver.compile_filter(&text, layer) {
        Ok(compiled) => {
            trace!("Compiled filter `{}` for {:?} layer", filter, layer);
            Ok(compiled)
        }
        Err(rejection) => {
            debug!(
                "Filter `{}` rejected at {}: {}",
                filter, rejection.position, rejection.message
            );
            let remainder = filter.clause().get(rejection.position..).unwrap_or_default();
            Err(DivertError::FilterRejected {
                message: rejection.message,
                position: rejection.position,
                remainder: remainder.to_string(),
            })
        }
    }
}

fn evaluate<D: Driver>(driver: &D, filter: &CStr, packet: &[u8], address: &Address) -> Result<bool> {
    driver
        .evaluate_filter(filter, packet, address)
        .map_err(DivertError::native)
}

/// Tests one packet against a textual filter without opening a handle.
pub fn evaluate_filter<D: Driver>(
    driver: &D,
    filter: &Filter,
    packet: &[u8],
    address: &Address,
) -> Result<bool> {
    evaluate(driver, &filter_text(filter)?, packet, address)
}

/// Tests one packet against a compiled filter.
pub fn evaluate_compiled<D: Driver>(
    driver: &D,
    filter: &CompiledFilter,
    packet: &[u8],
    address: &Address,
) -> Result<bool> {
    evaluate(driver, filter.as_c_str(), packet, address)
}

/// Renders a compiled filter back to text.
pub fn format_filter<D: Driver>(driver: &D, filter: &CompiledFilter, layer: Layer) -> Result<String> {
    driver.format_filter(filter, layer).map_err(DivertError::native)
}

/// Recomputes the IP and transport checksums of a raw packet in place.
///
/// Checksums named in `flags` are left untouched. When `address` is given,
/// its checksum-valid bits are updated. Returns `false` if the packet could
/// not be parsed.
pub fn calculate_checksums<D: Driver>(
    driver: &D,
    packet: &mut [u8],
    address: Option<&mut Address>,
    flags: ChecksumFlags,
) -> bool {
    let done = driver.calculate_checksums(packet, address, flags);
    if !done {
        trace!("Checksums skipped for unparseable {}-byte packet", packet.len());
    }
    done
}

/// Decrements the TTL or hop limit of a raw packet, keeping the header
/// checksum valid.
///
/// Returns `false` without changing anything if the value would reach zero
/// or the packet could not be parsed.
pub fn decrement_ttl<D: Driver>(driver: &D, packet: &mut [u8]) -> bool {
    driver.decrement_ttl(packet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::filter::Field;
    use crate::sys::mock::{Call, MockDriver, BAD_TOKEN};
    use crate::sys::ERROR_INVALID_PARAMETER;

    #[test]
    fn test_compile_and_format() {
        let driver = MockDriver::new();
        let filter = Field::TCP & Field::OUTBOUND;
        let compiled = compile_filter(&driver, &filter, Layer::Network).unwrap();
        assert_eq!(
            format_filter(&driver, &compiled, Layer::Network).unwrap(),
            "tcp and outbound"
        );
    }

    #[test]
    fn test_rejection_carries_remainder() {
        let driver = MockDriver::new();
        let filter = Filter::new("tcp and   invalid").unwrap();
        let error = compile_filter(&driver, &filter, Layer::Network).unwrap_err();
        assert_eq!(
            error.to_string(),
            format!("{BAD_TOKEN} (10): ...invalid")
        );
        assert!(matches!(
            error,
            DivertError::FilterRejected { position: 10, .. }
        ));
    }

    #[test]
    fn test_nul_byte_is_invalid_argument() {
        let driver = MockDriver::new();
        let filter = Filter::new("tcp\0").unwrap();
        assert!(matches!(
            compile_filter(&driver, &filter, Layer::Network),
            Err(DivertError::ArgumentInvalid { name: "filter", .. })
        ));
        assert_eq!(driver.count(|call| matches!(call, Call::Compile(_))), 0);
    }

    #[test]
    fn test_evaluate_maps_errors() {
        let driver = MockDriver::new();
        let address = Address::default();
        assert!(evaluate_filter(&driver, &Filter::always(), &[0x45; 20], &address).unwrap());

        driver.set_evaluation(Ok(false));
        let compiled = compile_filter(&driver, &Filter::always(), Layer::Network).unwrap();
        assert!(!evaluate_compiled(&driver, &compiled, &[0x45; 20], &address).unwrap());

        driver.set_evaluation(Err(ERROR_INVALID_PARAMETER));
        let error = evaluate_filter(&driver, &Filter::always(), &[], &address).unwrap_err();
        assert_eq!(error.native_code(), Some(ERROR_INVALID_PARAMETER));
    }

    #[test]
    fn test_checksums_go_through_the_driver() {
        let driver = MockDriver::new();
        let mut packet = vec![0x45; 20];
        let mut address = Address::default();
        assert!(calculate_checksums(
            &driver,
            &mut packet,
            Some(&mut address),
            ChecksumFlags::NO_TCP
        ));
        assert!(address.ip_checksum_valid());
        assert!(address.udp_checksum_valid());
        assert!(!address.tcp_checksum_valid());
        assert!(!calculate_checksums(&driver, &mut [0u8; 3], None, ChecksumFlags::empty()));
        assert_eq!(
            driver.calls(),
            [
                Call::Checksums(ChecksumFlags::NO_TCP),
                Call::Checksums(ChecksumFlags::empty())
            ]
        );
    }

    #[test]
    fn test_decrement_ttl_goes_through_the_driver() {
        let driver = MockDriver::new();
        let mut packet = vec![0u8; 40];
        packet[0] = 0x60;
        packet[7] = 64;
        assert!(decrement_ttl(&driver, &mut packet));
        assert_eq!(packet[7], 63);
        assert_eq!(driver.count(|call| matches!(call, Call::DecrementTtl)), 1);
    }
}
