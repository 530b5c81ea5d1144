use crate::seq::Seq;
use crate::MAX_CONN_PACKETS;
use std::collections::VecDeque;

/// A contiguous `(seq, bytes)` record captured from one direction of a
/// stream. The occupied sequence range is `[seq, seq + len - 1]`
/// inclusive; empty segments are never stored.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Segment {
    pub seq: Seq,
    pub bytes: Vec<u8>,
}

impl Segment {
    pub fn new(seq: Seq, bytes: Vec<u8>) -> Self {
        Segment { seq, bytes }
    }

    /// Sequence number of the last byte of this segment
    #[inline]
    pub fn last_seq(&self) -> Seq {
        self.seq.add(self.bytes.len() as i32 - 1)
    }
}

/// Bounded FIFO of the most recently reassembled segments of one
/// direction, oldest first.
///
/// Segments are only ever appended at the contiguous next-sequence
/// boundary, so entries are ordered by `seq` and pairwise disjoint
/// within the current window. Once `MAX_CONN_PACKETS` entries are held,
/// each append evicts the oldest.
#[derive(Debug, Default)]
pub struct SegmentRing {
    segments: VecDeque<Segment>,
}

impl SegmentRing {
    pub fn new() -> Self {
        SegmentRing {
            segments: VecDeque::with_capacity(MAX_CONN_PACKETS),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    #[inline]
    pub fn get(&self, idx: usize) -> Option<&Segment> {
        self.segments.get(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter()
    }

    /// Push the newest segment, evicting the oldest when full.
    pub fn push(&mut self, segment: Segment) {
        debug_assert!(!segment.bytes.is_empty());
        if self.segments.len() == MAX_CONN_PACKETS {
            self.segments.pop_front();
        }
        self.segments.push_back(segment);
    }

    /// Return the inclusive `(head, tail)` index range of stored segments
    /// whose sequence extent intersects `[start, end]`, or `None` if the
    /// incoming range touches no history.
    pub fn find_overlap(&self, start: Seq, end: Seq) -> Option<(usize, usize)> {
        let head = self.find_head(start, end)?;
        let tail = self.find_tail(head, end);
        Some((head, tail))
    }

    /// Backward walk from the newest segment looking for the one holding
    /// `start`.
    fn find_head(&self, start: Seq, end: Seq) -> Option<usize> {
        let newest = self.segments.back()?;
        if start.difference(newest.last_seq()) < 0 {
            // incoming segment is entirely in the future relative to
            // history; the common case for contiguous data
            trace!(
                "newest ring entry ends at {} before segment start {}",
                newest.last_seq(),
                start
            );
            return None;
        }
        let mut idx = self.segments.len() - 1;
        loop {
            let s = &self.segments[idx];
            let diff = s.seq.difference(start);
            if diff == 0 {
                return Some(idx);
            }
            if diff > 0 {
                // start lies after this segment's first byte; it is the
                // head only if it falls inside the segment extent
                return if start.difference(s.last_seq()) >= 0 {
                    Some(idx)
                } else {
                    None
                };
            }
            if idx == 0 {
                // walked past the oldest entry
                if self.segments[0].seq.difference(end) < 0 {
                    trace!("segment ends before the oldest ring entry");
                    return None;
                }
                return Some(0);
            }
            idx -= 1;
        }
    }

    /// Forward walk from `head`: the tail is the first segment covering
    /// `end`, or the newest one if none reaches that far.
    fn find_tail(&self, head: usize, end: Seq) -> usize {
        let mut idx = head;
        loop {
            let s = &self.segments[idx];
            if s.last_seq().difference(end) <= 0 {
                return idx;
            }
            if idx + 1 == self.segments.len() {
                return idx;
            }
            idx += 1;
        }
    }

    /// Extract the historical bytes overlapping `[start, end]` from the
    /// `(head, tail)` range returned by [`find_overlap`](Self::find_overlap).
    ///
    /// Returns the overlap bytes together with the start and end offsets
    /// of the matching region inside the incoming payload. Offsets
    /// outside the stored extents are a caller bug and abort.
    pub fn overlap_bytes(
        &self,
        head: usize,
        tail: usize,
        start: Seq,
        end: Seq,
    ) -> (Vec<u8>, usize, usize) {
        let head_seg = &self.segments[head];
        let tail_seg = &self.segments[tail];

        // clamp the requested range to what history actually holds
        let overlap_start = if head_seg.seq.difference(start) >= 0 {
            start
        } else {
            head_seg.seq
        };
        let tail_last = tail_seg.last_seq();
        let overlap_end = if tail_last.difference(end) <= 0 {
            end
        } else {
            tail_last
        };

        let head_offset = head_seg.seq.difference(overlap_start);
        let tail_offset = overlap_end.difference(tail_last);
        let start_slice = start.difference(overlap_start);
        assert!(
            head_offset >= 0 && tail_offset >= 0 && start_slice >= 0,
            "overlap extraction: negative offset (head {} tail {} start {})",
            head_offset,
            tail_offset,
            start_slice
        );
        let head_offset = head_offset as usize;
        let tail_offset = tail_offset as usize;
        let start_slice = start_slice as usize;

        if head == tail {
            let bytes = &head_seg.bytes;
            assert!(
                head_offset + tail_offset <= bytes.len(),
                "overlap extraction: offsets exceed segment length"
            );
            let end_slice = bytes.len() - tail_offset + start_slice - head_offset;
            let overlap = bytes[head_offset..bytes.len() - tail_offset].to_vec();
            return (overlap, start_slice, end_slice);
        }

        let total_len = start.difference(end) + 1;
        let end_offset = overlap_end.difference(end);
        assert!(
            total_len >= 0 && end_offset >= 0,
            "overlap extraction: inverted range"
        );
        let end_slice = total_len as usize - end_offset as usize;

        assert!(head_offset < head_seg.bytes.len());
        assert!(tail_offset <= tail_seg.bytes.len());
        let mut overlap = Vec::with_capacity(end_slice - start_slice);
        overlap.extend_from_slice(&head_seg.bytes[head_offset..]);
        for idx in head + 1..tail {
            overlap.extend_from_slice(&self.segments[idx].bytes);
        }
        overlap.extend_from_slice(&tail_seg.bytes[..tail_seg.bytes.len() - tail_offset]);
        (overlap, start_slice, end_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::{Segment, SegmentRing};
    use crate::seq::Seq;
    use crate::MAX_CONN_PACKETS;

    fn seg(seq: u32, bytes: &[u8]) -> Segment {
        Segment::new(Seq(seq), bytes.to_vec())
    }

    #[test]
    fn segment_last_seq() {
        assert_eq!(seg(1001, b"abc").last_seq(), Seq(1003));
        assert_eq!(seg(0xFFFF_FFFF, b"ab").last_seq(), Seq(0));
    }

    #[test]
    fn ring_evicts_oldest() {
        let mut ring = SegmentRing::new();
        for n in 0..MAX_CONN_PACKETS + 3 {
            ring.push(seg(n as u32 * 10, b"0123456789"));
        }
        assert_eq!(ring.len(), MAX_CONN_PACKETS);
        assert_eq!(ring.get(0).unwrap().seq, Seq(30));
    }

    #[test]
    fn overlap_empty_ring() {
        let ring = SegmentRing::new();
        assert_eq!(ring.find_overlap(Seq(1000), Seq(1002)), None);
    }

    #[test]
    fn overlap_future_segment() {
        let mut ring = SegmentRing::new();
        ring.push(seg(1001, b"abc"));
        // strictly adjacent but not overlapping
        assert_eq!(ring.find_overlap(Seq(1004), Seq(1006)), None);
        assert_eq!(ring.find_overlap(Seq(2000), Seq(2004)), None);
    }

    #[test]
    fn overlap_before_all_history() {
        let mut ring = SegmentRing::new();
        ring.push(seg(1001, b"abc"));
        // ends before the oldest stored byte
        assert_eq!(ring.find_overlap(Seq(900), Seq(950)), None);
        // reaches into the oldest stored segment
        assert_eq!(ring.find_overlap(Seq(999), Seq(1001)), Some((0, 0)));
    }

    #[test]
    fn overlap_exact_match() {
        let mut ring = SegmentRing::new();
        ring.push(seg(1001, b"abc"));
        assert_eq!(ring.find_overlap(Seq(1001), Seq(1003)), Some((0, 0)));
    }

    #[test]
    fn overlap_contained_in_one_segment() {
        let mut ring = SegmentRing::new();
        ring.push(seg(1001, b"abcdef"));
        let (head, tail) = ring.find_overlap(Seq(1002), Seq(1004)).unwrap();
        assert_eq!((head, tail), (0, 0));
        let (overlap, start_slice, end_slice) =
            ring.overlap_bytes(head, tail, Seq(1002), Seq(1004));
        assert_eq!(overlap, b"bcd");
        assert_eq!((start_slice, end_slice), (0, 3));
    }

    #[test]
    fn overlap_spanning_segments() {
        let mut ring = SegmentRing::new();
        ring.push(seg(1001, b"abc"));
        ring.push(seg(1004, b"def"));
        ring.push(seg(1007, b"ghi"));
        let (head, tail) = ring.find_overlap(Seq(1002), Seq(1008)).unwrap();
        assert_eq!((head, tail), (0, 2));
        let (overlap, start_slice, end_slice) =
            ring.overlap_bytes(head, tail, Seq(1002), Seq(1008));
        assert_eq!(overlap, b"bcdefgh");
        assert_eq!((start_slice, end_slice), (0, 7));
    }

    #[test]
    fn overlap_at_tail_of_newest() {
        // incoming segment begins on the last stored byte and extends past it
        let mut ring = SegmentRing::new();
        ring.push(seg(1001, b"abc"));
        let (head, tail) = ring.find_overlap(Seq(1003), Seq(1005)).unwrap();
        assert_eq!((head, tail), (0, 0));
        let (overlap, start_slice, end_slice) =
            ring.overlap_bytes(head, tail, Seq(1003), Seq(1005));
        assert_eq!(overlap, b"c");
        assert_eq!((start_slice, end_slice), (0, 1));
    }

    #[test]
    fn overlap_reaching_past_history() {
        // overlap starts inside stored data and runs past its end
        let mut ring = SegmentRing::new();
        ring.push(seg(1001, b"abc"));
        ring.push(seg(1004, b"def"));
        let (head, tail) = ring.find_overlap(Seq(1005), Seq(1009)).unwrap();
        assert_eq!((head, tail), (1, 1));
        let (overlap, start_slice, end_slice) =
            ring.overlap_bytes(head, tail, Seq(1005), Seq(1009));
        assert_eq!(overlap, b"ef");
        assert_eq!((start_slice, end_slice), (0, 2));
    }

    #[test]
    fn overlap_partially_populated_ring() {
        // fewer segments than capacity; the backward walk must stop at
        // the oldest entry, not index past it
        let mut ring = SegmentRing::new();
        ring.push(seg(5000, b"xy"));
        ring.push(seg(5002, b"z"));
        assert_eq!(ring.find_overlap(Seq(4000), Seq(4500)), None);
        assert_eq!(ring.find_overlap(Seq(4999), Seq(5002)), Some((0, 1)));
    }

    #[test]
    fn overlap_across_wrap_boundary() {
        let mut ring = SegmentRing::new();
        ring.push(seg(0xFFFF_FFFE, b"wxyz"));
        let (head, tail) = ring.find_overlap(Seq(0xFFFF_FFFF), Seq(0)).unwrap();
        let (overlap, start_slice, end_slice) =
            ring.overlap_bytes(head, tail, Seq(0xFFFF_FFFF), Seq(0));
        assert_eq!(overlap, b"xy");
        assert_eq!((start_slice, end_slice), (0, 2));
    }
}
