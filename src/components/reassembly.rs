//! Reassembly Component
//!
//! Out-of-order segments wait here, sorted and non-overlapping, until the
//! gap at `rcv_nxt` is filled. While inserting, the queue also works out
//! which SACK blocks the next ack should report: a D-SACK block for any
//! duplicate data, and the block enclosing the new segment.

use bitflags::bitflags;

use crate::options::SackBlock;
use crate::seq::{seq_diff, seq_gt, seq_leq};

bitflags! {
    /// SACK reporting flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SackFlags: u32 {
        /// `reportblk` describes duplicate data (D-SACK).
        const DUPSEG = 0x0001;
        /// `encloseblk` holds the block enclosing the last insertion.
        const ENCLOSESEG = 0x0002;
        /// The duplicate lies left of `rcv_nxt`.
        const SACKLEFT = 0x0004;
        /// A rescue retransmission went out in this recovery episode.
        const SACKRESCUED = 0x0008;
    }
}

/// One queued run of contiguous data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassEntry {
    pub seq: u32,
    pub data: Vec<u8>,
    pub fin: bool,
}

impl ReassEntry {
    #[inline]
    pub fn len(&self) -> u32 {
        self.data.len() as u32
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn end(&self) -> u32 {
        self.seq.wrapping_add(self.len())
    }

    /// Right edge of the SACK block covering this entry; a FIN counts.
    #[inline]
    pub fn sack_end(&self) -> u32 {
        sack_blkend(self.end(), self.fin)
    }

    fn trim_front(&mut self, n: u32) {
        let n = n.min(self.len());
        self.data.drain(..n as usize);
        self.seq = self.seq.wrapping_add(n);
    }
}

/// SACK block right edge for data ending at `end`.
#[inline]
pub fn sack_blkend(end: u32, fin: bool) -> u32 {
    end.wrapping_add(fin as u32)
}

/// What happened to a segment offered to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReassInsert {
    /// Entirely covered by queued data; `bytes` were duplicates.
    Duplicate { bytes: u32 },
    /// Queued (possibly trimmed or merged); `bytes` were new.
    Queued { bytes: u32 },
}

/// Reassembly State
///
/// Invariant: entries are sorted by `seq`, never overlap, and two entries
/// that touch are merged into one.
pub struct ReassemblyState {
    queue: Vec<ReassEntry>,

    /* SACK reporting */
    pub sack_flags: SackFlags,
    pub reportblk: SackBlock,
    pub encloseblk: SackBlock,
}

impl ReassemblyState {
    pub fn new() -> Self {
        Self {
            queue: Vec::new(),
            sack_flags: SackFlags::empty(),
            reportblk: SackBlock::new(0, 0),
            encloseblk: SackBlock::new(0, 0),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn entries(&self) -> &[ReassEntry] {
        &self.queue
    }

    /// Discard everything. Returns how many entries were freed.
    pub fn clear(&mut self) -> usize {
        let n = self.queue.len();
        self.queue.clear();
        n
    }

    // ------------------------------------------------------------------------
    // Insertion
    // ------------------------------------------------------------------------

    /// Insert `data` at `seq`. Overlap with queued data is trimmed from the
    /// new segment on the left and from queued entries on the right, so
    /// the newest copy of the bytes after the predecessor wins.
    pub fn insert(&mut self, mut seq: u32, mut data: Vec<u8>, mut fin: bool) -> ReassInsert {
        // Index of the first entry that starts after the new segment.
        let mut q = self
            .queue
            .iter()
            .position(|e| seq_gt(e.seq, seq))
            .unwrap_or(self.queue.len());
        let p = q.checked_sub(1);

        if let Some(pi) = p {
            let pred = &mut self.queue[pi];
            let i = seq_diff(pred.end(), seq);
            if i > 0 {
                self.sack_flags |= SackFlags::DUPSEG | SackFlags::ENCLOSESEG;
                self.encloseblk.start = pred.seq;
                let i = i as u32;
                if i as usize >= data.len() {
                    // A FIN counts only where the queued data ends.
                    if fin && i as usize == data.len() {
                        pred.fin = true;
                    }
                    self.encloseblk.end = pred.sack_end();
                    return ReassInsert::Duplicate { bytes: data.len() as u32 };
                }
                data.drain(..i as usize);
                seq = seq.wrapping_add(i);
                self.encloseblk.end = sack_blkend(seq.wrapping_add(data.len() as u32), fin);
                self.reportblk.end = seq;
            }
        }
        let bytes = data.len() as u32;

        // Trim or swallow the entries the new segment overlaps.
        while q < self.queue.len() {
            let end = seq.wrapping_add(data.len() as u32);
            let succ = &mut self.queue[q];
            let i = seq_diff(end, succ.seq);
            if i <= 0 {
                break;
            }
            if !self.sack_flags.contains(SackFlags::DUPSEG) {
                self.sack_flags |= SackFlags::DUPSEG | SackFlags::ENCLOSESEG;
                self.encloseblk = self.reportblk;
                self.reportblk.start = succ.seq;
            }
            let qend_sack = succ.sack_end();
            if self.sack_flags.contains(SackFlags::ENCLOSESEG)
                && seq_gt(qend_sack, self.encloseblk.end)
            {
                self.encloseblk.end = qend_sack;
            }
            if (i as u32) < succ.len() {
                succ.trim_front(i as u32);
                break;
            }
            if succ.fin {
                fin = true;
            }
            self.queue.remove(q);
        }

        let mut entry = ReassEntry { seq, data, fin };

        // Coalesce with the following entry.
        if q < self.queue.len() && entry.end() == self.queue[q].seq {
            let next = self.queue.remove(q);
            entry.data.extend_from_slice(&next.data);
            entry.fin |= next.fin;
            let tend_sack = entry.sack_end();
            self.encloseblk.end = tend_sack;
            if !self.sack_flags.contains(SackFlags::DUPSEG) {
                self.reportblk.end = tend_sack;
            }
        }

        // Coalesce with the preceding entry, or insert after it.
        match p {
            Some(pi) if self.queue[pi].end() == entry.seq => {
                let pred = &mut self.queue[pi];
                pred.fin |= entry.fin;
                pred.data.extend_from_slice(&entry.data);
                self.encloseblk.start = pred.seq;
                if !self.sack_flags.contains(SackFlags::DUPSEG) {
                    self.reportblk.start = pred.seq;
                }
            }
            _ => self.queue.insert(q, entry),
        }
        ReassInsert::Queued { bytes }
    }

    // ------------------------------------------------------------------------
    // Presentation
    // ------------------------------------------------------------------------

    /// Pop the head entry if it starts exactly at `rcv_nxt`. The caller
    /// advances `rcv_nxt` and hands the data to the socket.
    pub fn present(&mut self, rcv_nxt: u32) -> Option<ReassEntry> {
        if self.queue.first()?.seq != rcv_nxt {
            return None;
        }
        if !self.sack_flags.contains(SackFlags::DUPSEG) {
            // The ack advanced; nothing left to report.
            self.reportblk.start = self.reportblk.end;
        }
        self.sack_flags.remove(SackFlags::ENCLOSESEG);
        let head = self.queue.remove(0);
        debug_assert!(self.queue.first().map_or(true, |e| e.seq != head.end()));
        Some(head)
    }

    /// Whether a segment `[seq, seq + len)` would extend the last queued
    /// entry without overlapping the one before it. The PAWS tolerance
    /// only accepts old-timestamped data that fits like this.
    pub fn can_merge_last(&self, seq: u32, len: u32) -> bool {
        let Some(last) = self.queue.last() else {
            return false;
        };
        if last.end() == seq {
            return !last.fin;
        }
        if seq.wrapping_add(len) != last.seq {
            return false;
        }
        match self.queue.len().checked_sub(2).map(|i| &self.queue[i]) {
            None => true,
            Some(prev) => seq_leq(prev.end(), seq),
        }
    }

    // ------------------------------------------------------------------------
    // SACK reporting
    // ------------------------------------------------------------------------

    /// The next ack has SACK information to carry.
    pub fn report_needed(&self) -> bool {
        self.sack_flags
            .intersects(SackFlags::DUPSEG | SackFlags::ENCLOSESEG | SackFlags::SACKLEFT)
            || self.reportblk.start != self.reportblk.end
    }

    /// Reset reporting once the ack carrying the report went out.
    pub fn report_cleanup(&mut self) {
        self.sack_flags
            .remove(SackFlags::DUPSEG | SackFlags::ENCLOSESEG | SackFlags::SACKLEFT);
        self.reportblk.start = self.reportblk.end;
    }

    /// Forget the pending report block (the segment was not queued).
    pub fn drop_report(&mut self) {
        self.reportblk.start = self.reportblk.end;
    }

    /// Blocks for the next ack, at most `max`: the report block first (a
    /// D-SACK when DUPSEG is set), then the enclosing block, then the
    /// other queued runs in order.
    pub fn report_blocks(&self, max: usize) -> Vec<SackBlock> {
        let mut out: Vec<SackBlock> = Vec::with_capacity(max);
        let push = |out: &mut Vec<SackBlock>, b: SackBlock| {
            if out.len() < max && b.start != b.end && !out.contains(&b) {
                out.push(b);
            }
        };
        push(&mut out, self.reportblk);
        if self.sack_flags.contains(SackFlags::ENCLOSESEG) {
            push(&mut out, self.encloseblk);
        }
        for e in &self.queue {
            let blk = SackBlock::new(e.seq, e.sack_end());
            let covered = out
                .iter()
                .any(|b| seq_leq(b.start, blk.start) && seq_leq(blk.end, b.end));
            if !covered {
                push(&mut out, blk);
            }
        }
        out
    }
}

impl Default for ReassemblyState {
    fn default() -> Self {
        Self::new()
    }
}
