use core::mem;

use bytes::{Buf, Bytes};

/// Iterate over the CRLF separated lines of `bytes`
///
/// The final line may lack the terminator.
pub(crate) fn crlf_lines(bytes: Bytes) -> impl Iterator<Item = Bytes> {
    struct Lines(Bytes);

    impl Iterator for Lines {
        type Item = Bytes;

        fn next(&mut self) -> Option<Self::Item> {
            if self.0.is_empty() {
                return None;
            }

            Some(match memchr::memmem::find(&self.0, b"\r\n") {
                Some(i) => {
                    let line = self.0.split_to(i);
                    self.0.advance("\r\n".len());
                    line
                }
                None => mem::take(&mut self.0),
            })
        }
    }

    Lines(bytes)
}
