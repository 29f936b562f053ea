use core::array;

use bytes::{Buf, Bytes};

/// Split a control line into up to 6 whitespace separated arguments
///
/// Runs of spaces and tabs count as a single separator.
pub(crate) fn split_args(mut line: Bytes) -> impl Iterator<Item = Bytes> {
    let mut args = array::from_fn::<_, 6, _>(|_| Bytes::new());
    let mut len = 0;

    for arg in &mut args {
        let Some(i) = memchr::memchr2(b' ', b'\t', &line) else {
            if !line.is_empty() {
                *arg = line;
                len += 1;
            }
            break;
        };

        *arg = line.split_to(i);
        len += 1;

        let gap = line
            .iter()
            .take_while(|b| matches!(b, b' ' | b'\t'))
            .count();
        line.advance(gap);
    }

    args.into_iter().take(len)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::split_args;

    #[test]
    fn split() {
        let args = split_args(Bytes::from_static(b"orders.new 9 _INBOX.abc 11"))
            .collect::<alloc::vec::Vec<_>>();
        assert_eq!(
            args,
            ["orders.new", "9", "_INBOX.abc", "11"]
                .map(|arg| Bytes::from_static(arg.as_bytes()))
        );
    }

    #[test]
    fn split_collapses_separator_runs() {
        let args = split_args(Bytes::from_static(b"a  b\t\tc \t d")).collect::<alloc::vec::Vec<_>>();
        assert_eq!(
            args,
            ["a", "b", "c", "d"].map(|arg| Bytes::from_static(arg.as_bytes()))
        );
    }

    #[test]
    fn split_empty() {
        assert_eq!(split_args(Bytes::new()).count(), 0);
    }
}
