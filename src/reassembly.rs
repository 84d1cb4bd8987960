//! Out-of-order queueing and in-order draining of received segments.
//!
//! The functions here operate on plain queues. Locking, occupancy
//! accounting and socket notification are the caller's business.

use std::collections::VecDeque;

use crate::segment::{seq_after, seq_before, Segment};

/// Result of draining the out-of-order queue.
#[derive(Debug, Default)]
pub struct Drained {
    /// Receive sequence after the drain.
    pub rcv_nxt: u32,
    /// Segments appended to the receive queue.
    pub delivered: usize,
    /// Segments that carried no new bytes.
    pub dropped: Vec<Segment>,
    /// A FIN/RST packet met at the head. Draining stopped there.
    pub control: Option<Segment>,
}

/// Inserts `segment` into `queue`, ordered by start sequence.
///
/// Returns the segments that left the system: the new segment itself if an
/// earlier one already covers it, or queued segments the new one covers.
pub fn enqueue_out_of_order(queue: &mut VecDeque<Segment>, segment: Segment) -> Vec<Segment> {
    let mut dropped = Vec::new();

    if !segment.is_full_packet() && segment.is_empty() {
        dropped.push(segment);
        return dropped;
    }

    let seq = segment.seq();
    let end_seq = segment.end_seq();
    let control = segment.is_full_packet();

    // Scan back from the tail for the last segment not starting after us.
    let mut pred = None;
    for i in (0..queue.len()).rev() {
        if !seq_after(queue[i].seq(), seq) {
            pred = Some(i);
            break;
        }
    }

    if let Some(p) = pred.filter(|_| !control) {
        let prev = &queue[p];
        if seq_before(seq, prev.end_seq()) && !prev.is_full_packet() {
            if !seq_after(end_seq, prev.end_seq()) {
                log::trace!(
                    target: "inet-toe/reassembly",
                    "dropping {segment:?}, covered by {prev:?}"
                );
                dropped.push(segment);
                return dropped;
            }
            if !seq_after(seq, prev.seq()) {
                // Same start but longer: queue in front so the old one is
                // coalesced below.
                pred = p.checked_sub(1);
            }
        }
    }

    let at = pred.map_or(0, |p| p + 1);
    queue.insert(at, segment);

    if control {
        return dropped;
    }

    while let Some(next) = queue.get_mut(at + 1) {
        if !seq_after(end_seq, next.seq()) || next.is_full_packet() {
            break;
        }
        if seq_before(end_seq, next.end_seq()) {
            let overlap = end_seq.wrapping_sub(next.seq());
            next.trim_head(overlap);
            break;
        }
        if let Some(covered) = queue.remove(at + 1) {
            dropped.push(covered);
        }
    }

    dropped
}

/// Moves every segment that became contiguous with `rcv_nxt` from `ofo`
/// into `receive`, trimming bytes already received.
pub fn drain_contiguous(
    ofo: &mut VecDeque<Segment>,
    mut rcv_nxt: u32,
    receive: &mut VecDeque<Segment>,
) -> Drained {
    let mut drained = Drained::default();

    while let Some(head) = ofo.front() {
        if seq_after(head.seq(), rcv_nxt) {
            break;
        }

        let full_packet = head.is_full_packet();
        let behind = !seq_after(head.end_seq(), rcv_nxt);
        let Some(mut seg) = ofo.pop_front() else {
            break;
        };

        if full_packet {
            drained.control = Some(seg);
            break;
        }
        if behind {
            drained.dropped.push(seg);
            continue;
        }

        seg.trim_head(rcv_nxt.wrapping_sub(seg.seq()));
        rcv_nxt = seg.end_seq();
        receive.push_back(seg);
        drained.delivered += 1;
    }

    drained.rcv_nxt = rcv_nxt;
    drained
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn data(seq: u32, len: usize) -> Segment {
        Segment::data(seq, vec![0xab; len])
    }

    fn ranges(q: &VecDeque<Segment>) -> Vec<(u32, u32)> {
        q.iter().map(|s| (s.seq(), s.end_seq())).collect()
    }

    #[test]
    fn insert_sorted_from_any_order() {
        let mut q = VecDeque::new();
        for seq in [300, 100, 500, 200, 400] {
            assert!(enqueue_out_of_order(&mut q, data(seq, 100)).is_empty());
        }
        assert_eq!(
            ranges(&q),
            vec![(100, 200), (200, 300), (300, 400), (400, 500), (500, 600)]
        );
    }

    #[test]
    fn drop_contained_duplicate() {
        let mut q = VecDeque::new();
        enqueue_out_of_order(&mut q, data(100, 200));
        let dropped = enqueue_out_of_order(&mut q, data(150, 50));
        assert_eq!(dropped.len(), 1);
        assert_eq!(ranges(&q), vec![(100, 300)]);

        let dropped = enqueue_out_of_order(&mut q, data(100, 200));
        assert_eq!(dropped.len(), 1);
        assert_eq!(ranges(&q), vec![(100, 300)]);
    }

    #[test]
    fn partial_overlap_is_kept_untrimmed() {
        let mut q = VecDeque::new();
        enqueue_out_of_order(&mut q, data(100, 100));
        assert!(enqueue_out_of_order(&mut q, data(150, 100)).is_empty());
        assert_eq!(ranges(&q), vec![(100, 200), (150, 250)]);
    }

    #[test]
    fn equal_start_longer_segment_replaces() {
        let mut q = VecDeque::new();
        enqueue_out_of_order(&mut q, data(100, 50));
        let dropped = enqueue_out_of_order(&mut q, data(100, 100));
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].end_seq(), 150);
        assert_eq!(ranges(&q), vec![(100, 200)]);
    }

    #[test]
    fn forward_coalescing() {
        let mut q = VecDeque::new();
        enqueue_out_of_order(&mut q, data(200, 50));
        enqueue_out_of_order(&mut q, data(260, 20));
        enqueue_out_of_order(&mut q, data(290, 50));

        let dropped = enqueue_out_of_order(&mut q, data(150, 150));
        assert_eq!(dropped.len(), 2);
        // The partially covered tail segment is trimmed to the new end.
        assert_eq!(ranges(&q), vec![(150, 300), (300, 340)]);
        assert_eq!(q[1].len(), 40);
    }

    #[test]
    fn zero_length_data_dropped() {
        let mut q = VecDeque::new();
        let dropped = enqueue_out_of_order(&mut q, Segment::data(100, Bytes::new()));
        assert_eq!(dropped.len(), 1);
        assert!(q.is_empty());
    }

    #[test]
    fn control_not_swallowed_by_data() {
        let mut q = VecDeque::new();
        enqueue_out_of_order(&mut q, Segment::fin(300, Bytes::from_static(b"fin")));
        let dropped = enqueue_out_of_order(&mut q, data(200, 200));
        assert!(dropped.is_empty());
        assert_eq!(ranges(&q), vec![(200, 400), (300, 301)]);
    }

    #[test]
    fn drain_in_order() {
        let mut ofo = VecDeque::new();
        let mut rx = VecDeque::new();
        enqueue_out_of_order(&mut ofo, data(1100, 100));
        enqueue_out_of_order(&mut ofo, data(1000, 100));

        let drained = drain_contiguous(&mut ofo, 1000, &mut rx);
        assert_eq!(drained.rcv_nxt, 1200);
        assert_eq!(drained.delivered, 2);
        assert!(drained.control.is_none());
        assert!(ofo.is_empty());
        assert_eq!(ranges(&rx), vec![(1000, 1100), (1100, 1200)]);
    }

    #[test]
    fn drain_stops_at_gap() {
        let mut ofo = VecDeque::new();
        let mut rx = VecDeque::new();
        enqueue_out_of_order(&mut ofo, data(1100, 100));

        let drained = drain_contiguous(&mut ofo, 1000, &mut rx);
        assert_eq!(drained.rcv_nxt, 1000);
        assert_eq!(drained.delivered, 0);
        assert_eq!(ofo.len(), 1);
        assert!(rx.is_empty());
    }

    #[test]
    fn drain_trims_and_drops_stale() {
        let mut ofo = VecDeque::new();
        let mut rx = VecDeque::new();
        enqueue_out_of_order(&mut ofo, data(900, 50));
        enqueue_out_of_order(&mut ofo, data(950, 100));
        enqueue_out_of_order(&mut ofo, data(1050, 10));

        let drained = drain_contiguous(&mut ofo, 1000, &mut rx);
        assert_eq!(drained.dropped.len(), 1);
        assert_eq!(drained.rcv_nxt, 1060);
        assert_eq!(ranges(&rx), vec![(1000, 1050), (1050, 1060)]);
        assert_eq!(rx[0].len(), 50);
    }

    #[test]
    fn drain_stops_at_control() {
        let mut ofo = VecDeque::new();
        let mut rx = VecDeque::new();
        enqueue_out_of_order(&mut ofo, data(1000, 100));
        enqueue_out_of_order(&mut ofo, Segment::fin(1100, Bytes::new()));
        enqueue_out_of_order(&mut ofo, data(1101, 100));

        let drained = drain_contiguous(&mut ofo, 1000, &mut rx);
        assert_eq!(drained.rcv_nxt, 1100);
        assert!(drained.control.map(|c| c.is_fin()).unwrap_or(false));
        assert_eq!(ofo.len(), 1);
        assert_eq!(rx.len(), 1);
    }

    #[test]
    fn wrapping_sequence_space() {
        let mut ofo = VecDeque::new();
        let mut rx = VecDeque::new();
        let start = u32::MAX - 49;
        enqueue_out_of_order(&mut ofo, data(start.wrapping_add(100), 100));
        enqueue_out_of_order(&mut ofo, data(start, 100));

        assert_eq!(ofo[0].seq(), start);
        let drained = drain_contiguous(&mut ofo, start, &mut rx);
        assert_eq!(drained.rcv_nxt, start.wrapping_add(200));
        assert_eq!(rx.len(), 2);
    }
}
