use std::fmt::Write;

/// Words per dump line.
const LINE_WORDS: usize = 8;

/// Format little-endian words as `offset: word word ...` lines.
///
/// Offsets are byte offsets relative to the start of `data`. A trailing
/// partial word is printed byte by byte.
pub fn hexdump(data: &[u8]) -> String {
    let mut out = String::new();
    for (line, chunk) in data.chunks(LINE_WORDS * 4).enumerate() {
        if line > 0 {
            out.push('\n');
        }
        let _ = write!(out, "{:08x}:", line * LINE_WORDS * 4);
        for word in chunk.chunks(4) {
            if let Ok(bytes) = <[u8; 4]>::try_from(word) {
                let _ = write!(out, " {:08x}", u32::from_le_bytes(bytes));
            } else {
                out.push(' ');
                for b in word {
                    let _ = write!(out, "{:02x}", b);
                }
            }
        }
    }
    out
}
