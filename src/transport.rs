//! TCP byte-stream framing: standard-mode transport frames carry no
//! length prefix, so the receiver scans an accumulating buffer for the
//! next expected encrypted-nonce trailer to find where one frame ends
//! and the next begins. Grounded on the "TCP frame scan" described in
//! the wire format section -- the reference implementation does the
//! same substring search over its read buffer.

pub const NONCE_SIZE: usize = 8;

/// Accumulates bytes read from a TCP stream and slices off complete
/// frames as their expected trailing nonce comes into view.
pub struct TcpFrameScanner {
    buf: Vec<u8>,
    max_buf: usize,
}

impl TcpFrameScanner {
    pub fn new(max_buf: usize) -> Self {
        Self {
            buf: Vec::with_capacity(max_buf.min(4096)),
            max_buf,
        }
    }

    /// Appends newly-read bytes. Errors if the buffer would exceed
    /// `max_buf` without a match -- if the buffer fills without ever
    /// finding the expected nonce, the session is treated as stalled.
    pub fn feed(&mut self, data: &[u8]) -> crate::Result<()> {
        if self.buf.len() + data.len() > self.max_buf {
            return Err("tcp frame scan buffer overflow".into());
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// Looks for `expected_nonce` in the buffer; if found, the bytes up
    /// to and including it are drained off and returned as one frame,
    /// and the remainder becomes the head of the buffer for the next
    /// scan.
    pub fn next_frame(&mut self, expected_nonce: &[u8; NONCE_SIZE]) -> Option<Vec<u8>> {
        let pos = self
            .buf
            .windows(NONCE_SIZE)
            .position(|window| window == expected_nonce)?;
        let frame_end = pos + NONCE_SIZE;
        let frame = self.buf[..frame_end].to_vec();
        self.buf.drain(..frame_end);
        Some(frame)
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_frame_boundary_on_nonce_match() {
        let mut scanner = TcpFrameScanner::new(4096);
        let nonce = [9u8; NONCE_SIZE];
        let mut data = vec![1, 2, 3, 4, 5];
        data.extend_from_slice(&nonce);
        data.extend_from_slice(&[6, 7, 8]);
        scanner.feed(&data).unwrap();

        let frame = scanner.next_frame(&nonce).unwrap();
        assert_eq!(frame.len(), 5 + NONCE_SIZE);
        assert!(scanner.next_frame(&nonce).is_none());
    }

    #[test]
    fn overflow_without_match_is_rejected() {
        let mut scanner = TcpFrameScanner::new(8);
        assert!(scanner.feed(&[0u8; 16]).is_err());
    }
}
