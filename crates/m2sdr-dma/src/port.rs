//! Register port: narrow synchronous access to 32-bit device registers.

use m2sdr_proto::csr;

use crate::error::DmaResult;

/// Single-word access into the device's MMIO region.
///
/// Implementations are expected to perform one 32-bit transaction per call
/// and to reject addresses outside the region. No ordering is assumed across
/// calls beyond what the platform guarantees for MMIO; callers that need a
/// descriptor-write/enable-write release pair insert their own fence.
pub trait RegisterPort {
    fn read_reg(&self, addr: u32) -> DmaResult<u32>;
    fn write_reg(&self, addr: u32, value: u32) -> DmaResult<()>;
}

/// Writes a 64-bit field as two words, low word at `addr`.
///
/// The word order is part of the register's definition; see
/// [`m2sdr_proto::csr::split64`].
pub fn write_u64_lo_hi<P: RegisterPort + ?Sized>(port: &P, addr: u32, value: u64) -> DmaResult<()> {
    for (off, word) in csr::split64::lo_hi(value) {
        port.write_reg(addr + off, word)?;
    }
    Ok(())
}

/// Writes a 64-bit field as two words, high word at `addr`.
pub fn write_u64_hi_lo<P: RegisterPort + ?Sized>(port: &P, addr: u32, value: u64) -> DmaResult<()> {
    for (off, word) in csr::split64::hi_lo(value) {
        port.write_reg(addr + off, word)?;
    }
    Ok(())
}

/// Reads a 64-bit field laid out low word first.
pub fn read_u64_lo_hi<P: RegisterPort + ?Sized>(port: &P, addr: u32) -> DmaResult<u64> {
    let lo = port.read_reg(addr)?;
    let hi = port.read_reg(addr + 4)?;
    Ok(csr::split64::from_lo_hi(lo, hi))
}

/// Reads a 64-bit field laid out high word first.
pub fn read_u64_hi_lo<P: RegisterPort + ?Sized>(port: &P, addr: u32) -> DmaResult<u64> {
    let hi = port.read_reg(addr)?;
    let lo = port.read_reg(addr + 4)?;
    Ok(csr::split64::from_hi_lo(hi, lo))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockSdr;
    use m2sdr_proto::csr::CSR_SCRATCH;

    #[test]
    fn scratch_roundtrip() {
        let mock = MockSdr::new(1);
        mock.write_reg(CSR_SCRATCH, 0x1234_5678).unwrap();
        assert_eq!(mock.read_reg(CSR_SCRATCH).unwrap(), 0x1234_5678);
        mock.write_reg(CSR_SCRATCH, 0xdead_beef).unwrap();
        assert_eq!(mock.read_reg(CSR_SCRATCH).unwrap(), 0xdead_beef);
    }

    #[test]
    fn split_helpers_agree_with_their_conventions() {
        let mock = MockSdr::new(1);
        // The scratch register and its neighbour are both plain 32-bit
        // registers; use them as a scratch pair for the helper order checks.
        write_u64_lo_hi(&mock, CSR_SCRATCH, 0xAABB_CCDD_1122_3344).unwrap();
        assert_eq!(mock.read_reg(CSR_SCRATCH).unwrap(), 0x1122_3344);
        assert_eq!(
            read_u64_lo_hi(&mock, CSR_SCRATCH).unwrap(),
            0xAABB_CCDD_1122_3344
        );

        write_u64_hi_lo(&mock, CSR_SCRATCH, 0xAABB_CCDD_1122_3344).unwrap();
        assert_eq!(mock.read_reg(CSR_SCRATCH).unwrap(), 0xAABB_CCDD);
        assert_eq!(
            read_u64_hi_lo(&mock, CSR_SCRATCH).unwrap(),
            0xAABB_CCDD_1122_3344
        );
    }
}
