//! XOR masking of frame payloads (RFC 6455 section 5.3).
//!
//! Masking is its own inverse: applying the same key twice restores the
//! original bytes, so one function serves for both masking and unmasking.

/// Masks or unmasks `buf` in place with the 4-byte `key`.
///
/// Byte `i` is XORed with `key[i % 4]`. Buffers of 16 bytes or more are
/// processed eight bytes at a time.
#[inline]
pub fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    if buf.len() < 16 {
        apply_mask_bytewise(buf, key);
    } else {
        apply_mask_words(buf, key);
    }
}

/// Returns a masked copy of `data`.
pub fn mask(data: &[u8], key: [u8; 4]) -> Vec<u8> {
    let mut out = data.to_vec();
    apply_mask(&mut out, key);
    out
}

#[inline(always)]
fn apply_mask_bytewise(buf: &mut [u8], key: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}

/// Word-sized variant. Every chunk starts at a multiple of 8, so the key
/// phase is the same for each chunk and for the remainder.
#[inline(always)]
fn apply_mask_words(buf: &mut [u8], key: [u8; 4]) {
    let word = u64::from_ne_bytes([
        key[0], key[1], key[2], key[3], key[0], key[1], key[2], key[3],
    ]);

    let mut chunks = buf.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(chunk);
        let masked = u64::from_ne_bytes(bytes) ^ word;
        chunk.copy_from_slice(&masked.to_ne_bytes());
    }

    apply_mask_bytewise(chunks.into_remainder(), key);
}
