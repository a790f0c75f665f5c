// Copyright © 2018 Cormac O'Brien
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

//! MD4 digest of a map file, folded to the 32-bit checksum clients compare
//! against the server's copy. MD4 is long broken as a cryptographic hash;
//! here it only has to agree with every other implementation of the same
//! map format.

const INIT: [u32; 4] = [0x6745_2301, 0xefcd_ab89, 0x98ba_dcfe, 0x1032_5476];

fn f(x: u32, y: u32, z: u32) -> u32 {
    (x & y) | (!x & z)
}

fn g(x: u32, y: u32, z: u32) -> u32 {
    (x & y) | (x & z) | (y & z)
}

fn h(x: u32, y: u32, z: u32) -> u32 {
    x ^ y ^ z
}

fn transform(state: &mut [u32; 4], block: &[u8]) {
    debug_assert_eq!(block.len(), 64);

    let mut x = [0u32; 16];
    for (i, word) in x.iter_mut().enumerate() {
        *word = u32::from(block[i * 4])
            | u32::from(block[i * 4 + 1]) << 8
            | u32::from(block[i * 4 + 2]) << 16
            | u32::from(block[i * 4 + 3]) << 24;
    }

    let [mut a, mut b, mut c, mut d] = *state;

    // round 1
    for &i in &[0usize, 4, 8, 12] {
        a = a.wrapping_add(f(b, c, d)).wrapping_add(x[i]).rotate_left(3);
        d = d
            .wrapping_add(f(a, b, c))
            .wrapping_add(x[i + 1])
            .rotate_left(7);
        c = c
            .wrapping_add(f(d, a, b))
            .wrapping_add(x[i + 2])
            .rotate_left(11);
        b = b
            .wrapping_add(f(c, d, a))
            .wrapping_add(x[i + 3])
            .rotate_left(19);
    }

    // round 2
    for &i in &[0usize, 1, 2, 3] {
        a = a
            .wrapping_add(g(b, c, d))
            .wrapping_add(x[i])
            .wrapping_add(0x5a82_7999)
            .rotate_left(3);
        d = d
            .wrapping_add(g(a, b, c))
            .wrapping_add(x[i + 4])
            .wrapping_add(0x5a82_7999)
            .rotate_left(5);
        c = c
            .wrapping_add(g(d, a, b))
            .wrapping_add(x[i + 8])
            .wrapping_add(0x5a82_7999)
            .rotate_left(9);
        b = b
            .wrapping_add(g(c, d, a))
            .wrapping_add(x[i + 12])
            .wrapping_add(0x5a82_7999)
            .rotate_left(13);
    }

    // round 3
    for &i in &[0usize, 2, 1, 3] {
        a = a
            .wrapping_add(h(b, c, d))
            .wrapping_add(x[i])
            .wrapping_add(0x6ed9_eba1)
            .rotate_left(3);
        d = d
            .wrapping_add(h(a, b, c))
            .wrapping_add(x[i + 8])
            .wrapping_add(0x6ed9_eba1)
            .rotate_left(9);
        c = c
            .wrapping_add(h(d, a, b))
            .wrapping_add(x[i + 4])
            .wrapping_add(0x6ed9_eba1)
            .rotate_left(11);
        b = b
            .wrapping_add(h(c, d, a))
            .wrapping_add(x[i + 12])
            .wrapping_add(0x6ed9_eba1)
            .rotate_left(15);
    }

    state[0] = state[0].wrapping_add(a);
    state[1] = state[1].wrapping_add(b);
    state[2] = state[2].wrapping_add(c);
    state[3] = state[3].wrapping_add(d);
}

/// Computes the MD4 digest of `data` as four little-endian state words.
pub fn md4(data: &[u8]) -> [u32; 4] {
    let mut state = INIT;

    let mut chunks = data.chunks_exact(64);
    for block in &mut chunks {
        transform(&mut state, block);
    }

    // pad the tail: 0x80, zeros, then the bit count as a little-endian u64
    let tail = chunks.remainder();
    let mut last = [0u8; 128];
    last[..tail.len()].copy_from_slice(tail);
    last[tail.len()] = 0x80;

    let padded_len = if tail.len() < 56 { 64 } else { 128 };
    let bit_count = (data.len() as u64).wrapping_mul(8);
    last[padded_len - 8..padded_len].copy_from_slice(&bit_count.to_le_bytes());

    transform(&mut state, &last[..64]);
    if padded_len == 128 {
        transform(&mut state, &last[64..]);
    }

    state
}

/// The 32-bit map checksum: all four digest words XORed together.
pub fn block_checksum(data: &[u8]) -> u32 {
    let digest = md4(data);
    digest[0] ^ digest[1] ^ digest[2] ^ digest[3]
}

#[cfg(test)]
mod test {
    use super::*;

    fn hex(digest: [u32; 4]) -> String {
        let mut out = String::new();
        for word in digest.iter() {
            for byte in word.to_le_bytes().iter() {
                out.push_str(&format!("{:02x}", byte));
            }
        }
        out
    }

    // vectors from RFC 1320
    #[test]
    fn test_md4_rfc_vectors() {
        assert_eq!(hex(md4(b"")), "31d6cfe0d16ae931b73c59d7e0c089c0");
        assert_eq!(hex(md4(b"a")), "bde52cb31de33e46245e05fbdbd6fb24");
        assert_eq!(hex(md4(b"abc")), "a448017aaf21d8525fc10ae87aa6729d");
        assert_eq!(
            hex(md4(b"message digest")),
            "d9130a8164549fe818874806e1c7014b"
        );
        assert_eq!(
            hex(md4(b"abcdefghijklmnopqrstuvwxyz")),
            "d79e1c308aa5bbcdeea8ed63df412da9"
        );
        assert_eq!(
            hex(md4(
                b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789"
                    as &[u8]
            )),
            "043f8582f241db351ce627e153e7f0e4"
        );
    }

    #[test]
    fn test_md4_block_boundaries() {
        // 55, 56 and 64 byte messages exercise each padding shape
        for &len in &[55usize, 56, 63, 64, 65, 119, 120, 128] {
            let data = vec![0xabu8; len];
            let digest = md4(&data);
            // state must have been mixed away from the initial constants
            assert_ne!(digest, INIT, "len {}", len);
        }
    }

    #[test]
    fn test_block_checksum_folds_digest() {
        let digest = md4(b"abc");
        assert_eq!(
            block_checksum(b"abc"),
            digest[0] ^ digest[1] ^ digest[2] ^ digest[3]
        );
        assert_ne!(block_checksum(b"abc"), block_checksum(b"abd"));
    }
}
