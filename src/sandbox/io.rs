//! Capped accumulation of guest stdout/stderr.

use bytes::Bytes;

use crate::sandbox::types::OutputStream;

/// A byte buffer that keeps at most `cap` bytes and remembers what it dropped.
#[derive(Debug, Clone)]
pub struct CappedBuffer {
    buffer: Vec<u8>,
    cap: usize,
    dropped: u64,
}

impl CappedBuffer {
    /// Create an empty buffer retaining at most `cap` bytes.
    pub fn new(cap: usize) -> Self {
        Self {
            buffer: Vec::new(),
            cap,
            dropped: 0,
        }
    }

    /// Append `chunk`, returning the prefix that was actually retained.
    ///
    /// Bytes beyond the cap are counted in [`dropped`](Self::dropped) and discarded.
    pub fn push(&mut self, chunk: &[u8]) -> Bytes {
        let room = self.cap.saturating_sub(self.buffer.len());
        let kept = chunk.len().min(room);
        self.buffer.extend_from_slice(&chunk[..kept]);
        self.dropped += (chunk.len() - kept) as u64;
        Bytes::copy_from_slice(&chunk[..kept])
    }

    /// Number of bytes discarded at the cap.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Whether any bytes were discarded.
    pub fn is_truncated(&self) -> bool {
        self.dropped > 0
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Get the retained output as a string, replacing invalid UTF-8.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.buffer).into_owned()
    }
}

/// The pair of capped buffers a supervisor fills for one execution.
#[derive(Debug, Clone)]
pub struct OutputCapture {
    pub stdout: CappedBuffer,
    pub stderr: CappedBuffer,
}

impl OutputCapture {
    pub fn new(stdout_cap: usize, stderr_cap: usize) -> Self {
        Self {
            stdout: CappedBuffer::new(stdout_cap),
            stderr: CappedBuffer::new(stderr_cap),
        }
    }

    /// Route a chunk to the buffer for `stream`, returning the retained bytes.
    pub fn push(&mut self, stream: OutputStream, chunk: &[u8]) -> Bytes {
        match stream {
            OutputStream::Stdout => self.stdout.push(chunk),
            OutputStream::Stderr => self.stderr.push(chunk),
        }
    }

    pub fn is_truncated(&self) -> bool {
        self.stdout.is_truncated() || self.stderr.is_truncated()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_within_cap() {
        let mut buf = CappedBuffer::new(16);
        assert_eq!(buf.push(b"hello ").as_ref(), b"hello ");
        assert_eq!(buf.push(b"world").as_ref(), b"world");
        assert_eq!(buf.to_string_lossy(), "hello world");
        assert!(!buf.is_truncated());
    }

    #[test]
    fn test_truncates_at_cap() {
        let mut buf = CappedBuffer::new(8);
        assert_eq!(buf.push(b"12345").as_ref(), b"12345");
        assert_eq!(buf.push(b"67890").as_ref(), b"678");
        assert!(buf.push(b"more").is_empty());

        assert_eq!(buf.len(), 8);
        assert_eq!(buf.dropped(), 6);
        assert!(buf.is_truncated());
    }

    #[test]
    fn test_capture_routes_streams() {
        let mut capture = OutputCapture::new(4, 64);
        capture.push(OutputStream::Stderr, b"boom");
        capture.push(OutputStream::Stdout, b"abcdef");

        assert_eq!(capture.stdout.to_string_lossy(), "abcd");
        assert_eq!(capture.stderr.to_string_lossy(), "boom");
        assert!(capture.is_truncated());
    }
}
