/// Updates a running CRC-32 (IEEE) with `bytes`.
///
/// Start the running state at 0; chaining over consecutive chunks yields the
/// same result as one pass over their concatenation.
#[inline]
pub fn update_crc(crc: u32, bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(crc);
    hasher.update(bytes);
    hasher.finalize()
}
