use std::io::{ErrorKind, Read, Result};

/// Reads as many bytes as the stream can provide into `buf`, possibly
/// performing multiple reads to do so (and retrying on EINTR).
///
/// Unlike the standard `Read::read_exact()`, running out of input is not an
/// error here: the function returns the number of bytes actually read, which
/// is less than `buf.len()` only when the stream ended. The caller decides
/// what a short fill means — the const-size tar encoder zero-pads a source
/// that shrank under it, the dynamic-size encoder uses the count as the
/// entry size.
pub(crate) fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;

    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(filled)
}
