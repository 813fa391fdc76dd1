//! CRC-16/CCITT-FALSE: polynomial `0x1021`, initial value `0xFFFF`, no
//! input/output reflection, no final XOR. This is the `crc` crate's
//! catalog `CRC_16_IBM_3740` algorithm under a different name.

use crc::{Crc, CRC_16_IBM_3740};

/// The CCITT-FALSE checksum, as a reusable `Crc` instance.
pub const CRC_CCITT_FALSE: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Default seed for a fresh checksum.
pub const INITIAL: u16 = 0xFFFF;

/// Compute CRC-16/CCITT-FALSE over `buf`, continuing from `seed`.
///
/// Passing [`INITIAL`] as `seed` computes the checksum of `buf` alone;
/// passing a prior call's return value chains the computation across
/// multiple byte slices as if they had been concatenated.
pub fn crc16(buf: &[u8], seed: u16) -> u16 {
    let mut digest = CRC_CCITT_FALSE.digest_with_initial(seed);
    digest.update(buf);
    digest.finalize()
}
