//! MJPEG byte-stream demuxer.
//!
//! ffmpeg's `image2pipe` output is a plain concatenation of JPEG images with no
//! framing, so frames are recovered by scanning for the SOI/EOI markers. Reads
//! from the pipe land on arbitrary boundaries; all state needed to stitch a
//! frame back together lives in the demuxer between calls.

use crate::core::video::frame::RawFrame;

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

#[derive(Debug, Default)]
pub struct FrameDemuxer {
    buffer: Vec<u8>,
    /// Offset where the next EOI scan resumes, so a slow frame is not
    /// rescanned from the start on every push.
    scan_from: usize,
    next_index: u64,
}

impl FrameDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and return every frame completed by them, in order.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<RawFrame> {
        self.buffer.extend_from_slice(bytes);

        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame() {
            frames.push(frame);
        }
        frames
    }

    /// End of stream: drop whatever incomplete frame is still buffered.
    /// Returns the number of bytes discarded.
    pub fn finish(&mut self) -> usize {
        let discarded = self.buffer.len();
        self.buffer.clear();
        self.scan_from = 0;
        discarded
    }

    /// Number of frames emitted so far.
    pub fn frames_emitted(&self) -> u64 {
        self.next_index
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    fn next_frame(&mut self) -> Option<RawFrame> {
        let Some(start) = find_marker(&self.buffer, SOI, 0) else {
            // Garbage only. A trailing 0xFF may still open a marker.
            let keep = usize::from(self.buffer.last() == Some(&0xFF));
            let garbage = self.buffer.len() - keep;
            self.buffer.drain(..garbage);
            self.scan_from = 0;
            return None;
        };

        if start > 0 {
            self.buffer.drain(..start);
            self.scan_from = self.scan_from.saturating_sub(start);
        }

        let from = self.scan_from.max(SOI.len());
        match find_marker(&self.buffer, EOI, from) {
            Some(end) => {
                let data: Vec<u8> = self.buffer.drain(..end + EOI.len()).collect();
                self.scan_from = 0;
                let frame = RawFrame::new(self.next_index, data);
                self.next_index += 1;
                Some(frame)
            }
            None => {
                // Resume one byte back: the EOI may straddle this push.
                self.scan_from = self.buffer.len().saturating_sub(1).max(SOI.len());
                None
            }
        }
    }
}

fn find_marker(haystack: &[u8], marker: [u8; 2], from: usize) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(2)
        .position(|w| w == marker)
        .map(|pos| pos + from)
}
