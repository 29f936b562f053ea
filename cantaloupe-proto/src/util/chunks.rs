use alloc::collections::VecDeque;
use core::cmp::Ordering;
#[cfg(feature = "std")]
use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// A queue of byte chunks that implements [`Buf`] over their concatenation
#[derive(Debug)]
pub(crate) struct ChunkList {
    chunks: VecDeque<Bytes>,
    len: usize,
}

impl ChunkList {
    pub(crate) const fn new() -> Self {
        Self {
            chunks: VecDeque::new(),
            len: 0,
        }
    }

    pub(crate) fn push(&mut self, chunk: Bytes) {
        debug_assert!(!chunk.is_empty());
        self.len += chunk.len();
        self.chunks.push_back(chunk);
    }
}

impl Buf for ChunkList {
    fn remaining(&self) -> usize {
        self.len
    }

    fn has_remaining(&self) -> bool {
        !self.chunks.is_empty()
    }

    fn chunk(&self) -> &[u8] {
        self.chunks.front().map(Buf::chunk).unwrap_or_default()
    }

    fn advance(&mut self, mut cnt: usize) {
        assert!(
            cnt <= self.remaining(),
            "advance out of range ({} <= {})",
            cnt,
            self.remaining()
        );
        self.len -= cnt;

        while cnt > 0 {
            let front = self.chunks.front_mut().expect("len tracked chunks");
            if cnt < front.len() {
                front.advance(cnt);
                break;
            }

            cnt -= front.len();
            self.chunks.pop_front();
        }
    }

    #[cfg(feature = "std")]
    fn chunks_vectored<'a>(&'a self, mut dst: &mut [io::IoSlice<'a>]) -> usize {
        let mut filled = 0;
        for chunk in &self.chunks {
            let n = chunk.chunks_vectored(dst);
            filled += n;

            dst = &mut dst[n..];
            if dst.is_empty() {
                break;
            }
        }

        filled
    }

    fn copy_to_bytes(&mut self, len: usize) -> Bytes {
        assert!(
            len <= self.remaining(),
            "copy_to_bytes out of range ({} <= {})",
            len,
            self.remaining()
        );

        if let Some(front) = self.chunks.front_mut() {
            match front.len().cmp(&len) {
                Ordering::Greater => {
                    self.len -= len;
                    return front.split_to(len);
                }
                Ordering::Equal => {
                    self.len -= len;
                    return self.chunks.pop_front().expect("non-empty front");
                }
                Ordering::Less => {}
            }
        }

        let mut buf = BytesMut::with_capacity(len);
        buf.put(self.take(len));
        buf.freeze()
    }
}
