//! Bounded accumulation windows used during listening.

/// Accumulates voiced chunks for one candidate utterance.
///
/// Capacity is fixed at construction. Samples arriving after the window is
/// full are dropped (never overwrite earlier audio) but still counted, so the
/// utterance duration check sees how long the speaker actually talked.
#[derive(Debug)]
pub struct DetectionWindow {
    samples: Vec<i16>,
    capacity: usize,
    observed: usize,
}

impl DetectionWindow {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
            capacity,
            observed: 0,
        }
    }

    /// Append as much of `chunk` as fits. Returns the number of samples kept.
    pub fn append(&mut self, chunk: &[i16]) -> usize {
        self.observed = self.observed.saturating_add(chunk.len());
        let room = self.capacity - self.samples.len();
        let take = room.min(chunk.len());
        self.samples.extend_from_slice(&chunk[..take]);
        take
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples seen since the last reset, including dropped ones.
    pub fn observed(&self) -> usize {
        self.observed
    }

    pub fn reset(&mut self) {
        self.samples.clear();
        self.observed = 0;
    }
}

/// Fixed-size window that advances by a hop once full.
///
/// Feeds the learned classifier: every time the window fills, the caller
/// inspects [`SlidingWindow::full_window`] and then either [`slide`]s or
/// [`clear`]s it.
///
/// [`slide`]: SlidingWindow::slide
/// [`clear`]: SlidingWindow::clear
#[derive(Debug)]
pub struct SlidingWindow {
    buf: Vec<i16>,
    len: usize,
    hop: usize,
}

impl SlidingWindow {
    /// # Panics
    /// Panics if `hop` is zero or larger than `window`.
    pub fn new(window: usize, hop: usize) -> Self {
        assert!(hop > 0 && hop <= window, "hop must be in 1..=window");
        Self {
            buf: vec![0; window],
            len: 0,
            hop,
        }
    }

    /// Copy samples from `input` until the window is full.
    /// Returns how many samples of `input` were consumed.
    pub fn fill(&mut self, input: &[i16]) -> usize {
        let room = self.buf.len() - self.len;
        let take = room.min(input.len());
        self.buf[self.len..self.len + take].copy_from_slice(&input[..take]);
        self.len += take;
        take
    }

    /// The whole window, once it is full.
    pub fn full_window(&self) -> Option<&[i16]> {
        (self.len == self.buf.len()).then_some(&self.buf[..])
    }

    /// Drop the oldest `hop` samples, keeping the most recent `window - hop`.
    pub fn slide(&mut self) {
        let keep = self.len.saturating_sub(self.hop);
        self.buf.copy_within(self.len - keep..self.len, 0);
        self.len = keep;
    }

    pub fn clear(&mut self) {
        self.buf.iter_mut().for_each(|s| *s = 0);
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detection_window_drops_excess_without_overwriting() {
        let mut w = DetectionWindow::with_capacity(5);
        assert_eq!(w.append(&[1, 2, 3]), 3);
        assert_eq!(w.append(&[4, 5, 6, 7]), 2);
        assert_eq!(w.samples(), &[1, 2, 3, 4, 5]);
        assert_eq!(w.observed(), 7);

        w.reset();
        assert!(w.is_empty());
        assert_eq!(w.observed(), 0);
    }

    #[test]
    fn sliding_window_keeps_tail_after_slide() {
        let mut w = SlidingWindow::new(4, 2);
        assert_eq!(w.fill(&[1, 2, 3]), 3);
        assert!(w.full_window().is_none());
        assert_eq!(w.fill(&[4, 5]), 1);
        assert_eq!(w.full_window(), Some(&[1, 2, 3, 4][..]));

        w.slide();
        assert_eq!(w.len(), 2);
        assert_eq!(w.fill(&[5, 6]), 2);
        assert_eq!(w.full_window(), Some(&[3, 4, 5, 6][..]));
    }

    #[test]
    fn sliding_window_clear_empties() {
        let mut w = SlidingWindow::new(2, 1);
        w.fill(&[9, 9]);
        w.clear();
        assert!(w.is_empty());
        assert!(w.full_window().is_none());
    }
}
