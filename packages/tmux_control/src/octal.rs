//! Decoding of the octal escapes tmux applies to `%output` data.
//!
//! tmux writes any byte below 0x20 and the backslash itself as `\nnn`. Every
//! other byte is passed through untouched.

/// Decode `\nnn` escapes into raw bytes.
///
/// A backslash not followed by three octal digits is kept literally.
pub fn decode_octal(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if input[i] == b'\\' && i + 4 <= input.len() && is_octal_triplet(&input[i + 1..i + 4]) {
            let value = (u32::from(input[i + 1] - b'0') << 6)
                | (u32::from(input[i + 2] - b'0') << 3)
                | u32::from(input[i + 3] - b'0');
            // \400 and above cannot be a byte; keep them literal.
            if let Ok(byte) = u8::try_from(value) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(input[i]);
        i += 1;
    }
    out
}

fn is_octal_triplet(b: &[u8]) -> bool {
    b.len() == 3 && b.iter().all(|c| (b'0'..=b'7').contains(c))
}
