use std::io::Read;

use bytes::Bytes;

/// Scanner state for the length-prefixed frame machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Header,
    Payload,
}

/// Counts gRPC length-prefixed message frames in a byte stream.
///
/// Frame format: `[1 byte flags][4 bytes big-endian length][payload]`. The
/// counter is fed the stream as it passes through the proxy and increments
/// once per completed 5-byte header, so the result is independent of how the
/// transport chunks the bytes. Zero-length payloads count as frames.
#[derive(Debug, Clone)]
pub struct FrameCounter {
    state: ScanState,
    header: [u8; 5],
    filled: usize,
    remaining: usize,
    count: u64,
}

impl Default for FrameCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCounter {
    pub fn new() -> Self {
        Self {
            state: ScanState::Header,
            header: [0_u8; 5],
            filled: 0,
            remaining: 0,
            count: 0,
        }
    }

    /// Number of completed frame headers observed so far.
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn observe(&mut self, chunk: &[u8]) {
        let mut offset = 0_usize;
        while offset < chunk.len() {
            match self.state {
                ScanState::Header => {
                    let need = 5 - self.filled;
                    let take = need.min(chunk.len() - offset);
                    self.header[self.filled..self.filled + take]
                        .copy_from_slice(&chunk[offset..offset + take]);
                    self.filled += take;
                    offset += take;
                    if self.filled == 5 {
                        let length = u32::from_be_bytes([
                            self.header[1],
                            self.header[2],
                            self.header[3],
                            self.header[4],
                        ]) as usize;
                        self.count += 1;
                        self.filled = 0;
                        if length > 0 {
                            self.remaining = length;
                            self.state = ScanState::Payload;
                        }
                    }
                }
                ScanState::Payload => {
                    let take = self.remaining.min(chunk.len() - offset);
                    self.remaining -= take;
                    offset += take;
                    if self.remaining == 0 {
                        self.state = ScanState::Header;
                    }
                }
            }
        }
    }
}

/// Retains the first `cap` bytes of a stream without touching pass-through.
#[derive(Debug)]
pub struct CaptureBuffer {
    buf: Vec<u8>,
    cap: usize,
}

impl CaptureBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            buf: Vec::new(),
            cap,
        }
    }

    pub fn observe(&mut self, chunk: &[u8]) {
        let remaining = self.cap.saturating_sub(self.buf.len());
        if remaining == 0 || chunk.is_empty() {
            return;
        }
        let take = chunk.len().min(remaining);
        self.buf.extend_from_slice(&chunk[..take]);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Bytes {
        Bytes::from(self.buf)
    }
}

/// Extracts the first length-prefixed payload from captured bytes, gzip-
/// decompressing when the frame's compression flag is set.
///
/// Anything that does not parse as valid framing is returned unchanged, and
/// a payload that fails to decompress is returned compressed. The capture
/// path never fails outright.
pub fn extract_payload(data: Bytes) -> Bytes {
    if data.len() < 5 {
        return data;
    }
    let compressed = data[0];
    let length = u32::from_be_bytes([data[1], data[2], data[3], data[4]]) as usize;
    if data.len() - 5 < length {
        return data;
    }
    let payload = data.slice(5..5 + length);
    if compressed == 1 {
        match gunzip(&payload) {
            Ok(decoded) => Bytes::from(decoded),
            Err(_) => payload,
        }
    } else {
        payload
    }
}

/// Gzip-decodes `data` when it leads with the gzip magic, otherwise (or on
/// any decode error) returns it unchanged.
pub fn decompress_gzip(data: Bytes) -> Bytes {
    if data.len() < 2 || data[0] != 0x1f || data[1] != 0x8b {
        return data;
    }
    match gunzip(&data) {
        Ok(decoded) => Bytes::from(decoded),
        Err(_) => data,
    }
}

fn gunzip(input: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = flate2::read::GzDecoder::new(input);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
