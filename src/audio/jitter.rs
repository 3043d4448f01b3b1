use std::collections::BTreeMap;

/// Frames held before playout starts (3 x 20 ms).
pub const DEFAULT_DEPTH: usize = 3;
/// Hard cap; the oldest frames are discarded beyond this.
const MAX_BUFFERED: usize = 50;
/// First extended sequence number, leaves room for early arrivals below it.
const EXTENDED_BASE: u64 = 1 << 16;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JitterStats {
    pub received: u64,
    /// Arrived after their playout slot had passed.
    pub late: u64,
    /// Playout slots with no frame.
    pub lost: u64,
    pub buffered: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Playout<T> {
    Frame(T),
    /// The slot's frame is missing; conceal it.
    Missing,
    /// Not enough queued to start, or the speaker went quiet.
    Buffering,
}

/// Reorders frames by RTP sequence number. Frames that arrive after their
/// slot was played are dropped instead of stalling playout.
pub struct JitterBuffer<T> {
    frames: BTreeMap<u64, T>,
    next: Option<u64>,
    highest: Option<u64>,
    depth: usize,
    playing: bool,
    stats: JitterStats,
}

impl<T> JitterBuffer<T> {
    pub fn new() -> Self {
        Self::with_depth(DEFAULT_DEPTH)
    }

    pub fn with_depth(depth: usize) -> Self {
        Self {
            frames: BTreeMap::new(),
            next: None,
            highest: None,
            depth: depth.clamp(1, MAX_BUFFERED),
            playing: false,
            stats: JitterStats::default(),
        }
    }

    /// Map a wrapping 16-bit sequence onto a monotonic 64-bit one.
    fn extend(&self, seq: u16) -> u64 {
        match self.highest {
            Some(reference) => {
                let delta = seq.wrapping_sub(reference as u16) as i16 as i64;
                (reference as i64 + delta).max(0) as u64
            }
            None => EXTENDED_BASE + seq as u64,
        }
    }

    /// Queue a frame. Returns false if it was too late or a duplicate.
    pub fn insert(&mut self, seq: u16, payload: T) -> bool {
        let ext = self.extend(seq);
        self.stats.received += 1;

        if self.next.is_some_and(|next| ext < next) {
            self.stats.late += 1;
            return false;
        }
        if self.frames.contains_key(&ext) {
            return false;
        }

        self.frames.insert(ext, payload);
        self.highest = Some(self.highest.map_or(ext, |h| h.max(ext)));

        while self.frames.len() > MAX_BUFFERED {
            if let Some((dropped, _)) = self.frames.pop_first() {
                if self.next.is_some_and(|next| dropped >= next) {
                    self.next = Some(dropped + 1);
                }
            }
        }
        true
    }

    /// Called once per 20 ms playout tick.
    pub fn pull(&mut self) -> Playout<T> {
        if !self.playing {
            if self.frames.len() < self.depth {
                return Playout::Buffering;
            }
            self.playing = true;
            if self.next.is_none() {
                self.next = self.frames.keys().next().copied();
            }
        }

        let Some(next) = self.next else {
            return Playout::Buffering;
        };

        if let Some(frame) = self.frames.remove(&next) {
            self.next = Some(next + 1);
            return Playout::Frame(frame);
        }

        if self.frames.is_empty() {
            // Speaker stopped sending; rebuffer when they resume.
            self.playing = false;
            return Playout::Buffering;
        }

        self.stats.lost += 1;
        self.next = Some(next + 1);
        Playout::Missing
    }

    pub fn stats(&self) -> JitterStats {
        JitterStats {
            buffered: self.frames.len(),
            ..self.stats
        }
    }

    pub fn reset(&mut self) {
        self.frames.clear();
        self.next = None;
        self.highest = None;
        self.playing = false;
        self.stats = JitterStats::default();
    }
}

impl<T> Default for JitterBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}
