//! Bounded per-execution output buffer with cursor-addressable replay
//!
//! A single writer (the exec reader task) appends frames; any number of
//! pollers read by cursor without ever blocking the writer. When the byte
//! budget is exceeded, whole frames are evicted from the oldest end and
//! the `min_available_seq` watermark advances, which pollers observe as a
//! gap marker.

use std::collections::VecDeque;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;

use crate::database::ExecUsage;

/// Which stream a frame belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
    /// Terminal frame carrying exit code and usage
    Control,
}

/// Payload of the terminal control frame
#[derive(Debug, Clone, Serialize)]
pub struct ExitInfo {
    pub exit_code: Option<i64>,
    pub usage: ExecUsage,
    /// Set when the frame was emitted for a reason other than normal
    /// termination, e.g. `shutdown`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

/// One output frame. Frames are appended once and never mutated; `seq`
/// is strictly increasing per execution starting at 1.
#[derive(Debug, Clone)]
pub struct Frame {
    pub seq: u64,
    pub stream: StreamKind,
    pub data: Bytes,
    pub ts_ms: i64,
    pub exit: Option<ExitInfo>,
}

/// Result of a cursor poll
#[derive(Debug)]
pub struct PollResult {
    pub frames: Vec<Frame>,
    /// Set when frames before this sequence were evicted and the cursor
    /// pointed into the evicted range
    pub gap_from_seq: Option<u64>,
    /// True when the terminal frame exists and nothing after the cursor
    /// was omitted
    pub complete: bool,
}

struct RingInner {
    frames: VecDeque<Frame>,
    payload_bytes: usize,
    next_seq: u64,
    min_available_seq: u64,
    terminal: bool,
}

/// Bounded frame ring for one execution
pub struct RingBuffer {
    budget: usize,
    inner: Mutex<RingInner>,
}

impl RingBuffer {
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            inner: Mutex::new(RingInner {
                frames: VecDeque::new(),
                payload_bytes: 0,
                next_seq: 1,
                min_available_seq: 1,
                terminal: false,
            }),
        }
    }

    /// Append an output frame. Returns the assigned sequence and how many
    /// old frames were evicted to make room, or `None` if the execution
    /// already terminated (no frames follow the terminal frame).
    pub fn push(&self, stream: StreamKind, data: Bytes) -> Option<(u64, usize)> {
        let mut inner = self.inner.lock();
        if inner.terminal {
            return None;
        }

        // Evict oldest whole frames until the new frame fits. A frame
        // larger than the whole budget is still accepted on its own.
        let mut evicted = 0;
        while inner.payload_bytes + data.len() > self.budget {
            match inner.frames.pop_front() {
                Some(dropped) => {
                    inner.payload_bytes -= dropped.data.len();
                    evicted += 1;
                }
                None => break,
            }
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.payload_bytes += data.len();
        inner.frames.push_back(Frame {
            seq,
            stream,
            data,
            ts_ms: chrono::Utc::now().timestamp_millis(),
            exit: None,
        });
        if let Some(front) = inner.frames.front() {
            inner.min_available_seq = front.seq;
        }

        Some((seq, evicted))
    }

    /// Append the terminal control frame; exactly one per execution, and
    /// it always carries the largest sequence.
    pub fn push_terminal(&self, exit: ExitInfo) -> Option<u64> {
        let mut inner = self.inner.lock();
        if inner.terminal {
            return None;
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.frames.push_back(Frame {
            seq,
            stream: StreamKind::Control,
            data: Bytes::new(),
            ts_ms: chrono::Utc::now().timestamp_millis(),
            exit: Some(exit),
        });
        if let Some(front) = inner.frames.front() {
            inner.min_available_seq = front.seq;
        }
        inner.terminal = true;

        Some(seq)
    }

    /// Read frames after the cursor, up to `max_bytes` of payload. A
    /// cursor pointing before the eviction watermark resumes at
    /// `min_available_seq` with a gap marker.
    pub fn poll(&self, after_seq: u64, max_bytes: usize) -> PollResult {
        let inner = self.inner.lock();
        let max_seq = inner.next_seq - 1;

        let mut gap_from_seq = None;
        let mut start = after_seq + 1;
        if start < inner.min_available_seq {
            // Everything up to the watermark was evicted
            if !inner.frames.is_empty() || inner.min_available_seq > 1 {
                gap_from_seq = Some(inner.min_available_seq);
            }
            start = inner.min_available_seq;
        }

        let mut frames = Vec::new();
        let mut bytes = 0usize;
        if let Some(front) = inner.frames.front() {
            if start <= max_seq {
                let offset = (start - front.seq) as usize;
                for frame in inner.frames.iter().skip(offset) {
                    // Always return at least one frame per poll
                    if !frames.is_empty() && bytes + frame.data.len() > max_bytes {
                        break;
                    }
                    bytes += frame.data.len();
                    frames.push(frame.clone());
                }
            }
        }

        let reached = frames.last().map(|f| f.seq).unwrap_or(after_seq.min(max_seq));
        let complete = inner.terminal && reached == max_seq;

        PollResult {
            frames,
            gap_from_seq,
            complete,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.inner.lock().terminal
    }

    pub fn min_available_seq(&self) -> u64 {
        self.inner.lock().min_available_seq
    }

    pub fn max_seq(&self) -> u64 {
        self.inner.lock().next_seq - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_bytes(ring: &RingBuffer, n: usize) -> u64 {
        ring.push(StreamKind::Stdout, Bytes::from(vec![b'x'; n]))
            .expect("ring not terminal")
            .0
    }

    fn terminal(ring: &RingBuffer, code: i64) -> u64 {
        ring.push_terminal(ExitInfo {
            exit_code: Some(code),
            usage: ExecUsage::default(),
            reason: None,
        })
        .expect("first terminal")
    }

    #[test]
    fn test_seq_starts_at_one_and_increases() {
        let ring = RingBuffer::new(1024);
        assert_eq!(push_bytes(&ring, 4), 1);
        assert_eq!(push_bytes(&ring, 4), 2);
        assert_eq!(terminal(&ring, 0), 3);
        assert_eq!(ring.max_seq(), 3);
    }

    #[test]
    fn test_poll_from_zero_returns_everything() {
        let ring = RingBuffer::new(1024);
        push_bytes(&ring, 4);
        push_bytes(&ring, 4);
        terminal(&ring, 0);

        let result = ring.poll(0, usize::MAX);
        assert_eq!(result.frames.len(), 3);
        assert!(result.gap_from_seq.is_none());
        assert!(result.complete);
        let seqs: Vec<u64> = result.frames.iter().map(|f| f.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(result.frames[2].stream, StreamKind::Control);
    }

    #[test]
    fn test_poll_after_cursor_is_strictly_greater() {
        let ring = RingBuffer::new(1024);
        for _ in 0..5 {
            push_bytes(&ring, 4);
        }

        let result = ring.poll(3, usize::MAX);
        let seqs: Vec<u64> = result.frames.iter().map(|f| f.seq).collect();
        assert_eq!(seqs, vec![4, 5]);
        assert!(!result.complete);
    }

    #[test]
    fn test_poll_at_max_seq_is_empty() {
        let ring = RingBuffer::new(1024);
        push_bytes(&ring, 4);

        let result = ring.poll(1, usize::MAX);
        assert!(result.frames.is_empty());
        assert!(!result.complete);

        terminal(&ring, 0);
        let result = ring.poll(2, usize::MAX);
        assert!(result.frames.is_empty());
        assert!(result.complete);
    }

    #[test]
    fn test_budget_boundary() {
        let ring = RingBuffer::new(100);
        // Two 50-byte frames exactly fill the budget
        push_bytes(&ring, 50);
        push_bytes(&ring, 50);
        assert_eq!(ring.min_available_seq(), 1);

        // One more byte evicts exactly the oldest whole frame
        let (seq, evicted) = ring.push(StreamKind::Stdout, Bytes::from(vec![b'y'; 1])).unwrap();
        assert_eq!(seq, 3);
        assert_eq!(evicted, 1);
        assert_eq!(ring.min_available_seq(), 2);
    }

    #[test]
    fn test_oversized_frame_is_kept_alone() {
        let ring = RingBuffer::new(100);
        push_bytes(&ring, 40);
        push_bytes(&ring, 40);
        let (seq, evicted) = ring
            .push(StreamKind::Stdout, Bytes::from(vec![b'z'; 500]))
            .unwrap();
        assert_eq!(seq, 3);
        assert_eq!(evicted, 2);
        assert_eq!(ring.min_available_seq(), 3);

        let result = ring.poll(0, usize::MAX);
        assert_eq!(result.frames.len(), 1);
        assert_eq!(result.frames[0].data.len(), 500);
    }

    #[test]
    fn test_gap_marker_on_stale_cursor() {
        let ring = RingBuffer::new(100);
        for _ in 0..10 {
            push_bytes(&ring, 30); // keeps only the newest 3
        }
        let min = ring.min_available_seq();
        assert!(min > 1);

        let result = ring.poll(0, usize::MAX);
        assert_eq!(result.gap_from_seq, Some(min));
        assert_eq!(result.frames.first().unwrap().seq, min);

        // Cursor exactly at min - 1 needs no gap marker
        let result = ring.poll(min - 1, usize::MAX);
        assert!(result.gap_from_seq.is_none());
        assert_eq!(result.frames.first().unwrap().seq, min);
    }

    #[test]
    fn test_no_frames_after_terminal() {
        let ring = RingBuffer::new(1024);
        push_bytes(&ring, 4);
        let term_seq = terminal(&ring, 7);

        assert!(ring.push(StreamKind::Stdout, Bytes::from_static(b"late")).is_none());
        assert!(ring
            .push_terminal(ExitInfo {
                exit_code: Some(0),
                usage: ExecUsage::default(),
                reason: None,
            })
            .is_none());

        // Terminal frame still has the largest seq
        assert_eq!(ring.max_seq(), term_seq);
        let result = ring.poll(0, usize::MAX);
        let terminals: Vec<_> = result
            .frames
            .iter()
            .filter(|f| f.stream == StreamKind::Control)
            .collect();
        assert_eq!(terminals.len(), 1);
        assert_eq!(terminals[0].exit.as_ref().unwrap().exit_code, Some(7));
    }

    #[test]
    fn test_byte_capped_poll_is_incomplete() {
        let ring = RingBuffer::new(10 * 1024);
        for _ in 0..8 {
            push_bytes(&ring, 100);
        }
        terminal(&ring, 0);

        let result = ring.poll(0, 250);
        assert_eq!(result.frames.len(), 2);
        assert!(!result.complete);

        // Resuming from the returned cursor eventually completes
        let cursor = result.frames.last().unwrap().seq;
        let rest = ring.poll(cursor, usize::MAX);
        assert!(rest.complete);
        assert_eq!(rest.frames.last().unwrap().stream, StreamKind::Control);
    }
}
