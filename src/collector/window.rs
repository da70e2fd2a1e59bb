use crate::clock::Alignment;
use crate::table::Tick;

/// Shape of every per-key window: `left_span` buckets of history before the
/// current bucket and `right_span` buckets from it onward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowLayout {
    pub alignment: Alignment,
    pub left_span: usize,
    pub right_span: usize,
}

impl WindowLayout {
    /// Slot count `N`.
    pub fn slots(&self) -> usize {
        self.left_span + self.right_span
    }

    /// Seconds covered by one window.
    pub fn span_secs(&self) -> i64 {
        self.slots() as i64 * self.alignment.secs()
    }

    /// Window start for a window created at wall-clock `now`.
    pub fn anchor(&self, now: i64) -> i64 {
        self.alignment.floor(now) - self.left_span as i64 * self.alignment.secs()
    }
}

/// Inclusive slot range not yet handed to the durable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveRange {
    pub begin: usize,
    pub end: usize,
}

impl SaveRange {
    fn widen(self, other: SaveRange) -> SaveRange {
        SaveRange {
            begin: self.begin.min(other.begin),
            end: self.end.max(other.end),
        }
    }
}

/// Dense, fixed-length run of ticks for one key at the collector.
///
/// Slot `i` always holds the bucket starting at `base + i * alignment`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    base: i64,
    slots: Vec<Tick>,
    unsaved: Option<SaveRange>,
    touched_at: i64,
}

impl Window {
    fn empty(layout: &WindowLayout, base: i64, now: i64) -> Self {
        let step = layout.alignment.secs();
        let slots = (0..layout.slots() as i64)
            .map(|i| Tick::empty(base + i * step))
            .collect();
        Self {
            base,
            slots,
            unsaved: None,
            touched_at: now,
        }
    }

    /// Builds the first window for a key, anchored on `now`, and merges the
    /// initial ticks into it.
    pub fn create(layout: &WindowLayout, now: i64, ticks: &[Tick], bounds: (i64, i64)) -> Self {
        let mut window = Self::empty(layout, layout.anchor(now), now);
        window.merge(layout, now, ticks, bounds);
        window
    }

    pub fn base(&self) -> i64 {
        self.base
    }

    pub fn slots(&self) -> &[Tick] {
        &self.slots
    }

    pub fn unsaved(&self) -> Option<SaveRange> {
        self.unsaved
    }

    /// Clock time of the last merge into this window.
    pub fn touched_at(&self) -> i64 {
        self.touched_at
    }

    /// Exclusive end of the covered span.
    pub fn end(&self, layout: &WindowLayout) -> i64 {
        self.base + layout.span_secs()
    }

    /// Slot index for `ts`, or `None` when it falls outside the window.
    pub fn slot_index(&self, layout: &WindowLayout, ts: i64) -> Option<usize> {
        let i = layout.alignment.buckets_between(self.base, ts);
        (0..self.slots.len() as i64)
            .contains(&i)
            .then_some(i as usize)
    }

    /// Whether a snapshot whose newest tick is at `last` can merge in place.
    pub fn fits(&self, layout: &WindowLayout, last: i64) -> bool {
        last - self.base < layout.span_secs()
    }

    fn clamp_index(&self, layout: &WindowLayout, ts: i64) -> usize {
        let i = layout.alignment.buckets_between(self.base, ts);
        i.clamp(0, self.slots.len() as i64 - 1) as usize
    }

    /// Adds `ticks` into their slots and widens the unsaved range to cover
    /// `bounds` (the ticks' earliest and latest timestamps). Ticks outside
    /// the window are skipped.
    pub fn merge(&mut self, layout: &WindowLayout, now: i64, ticks: &[Tick], bounds: (i64, i64)) {
        if self.slots.is_empty() {
            return;
        }

        let touched = SaveRange {
            begin: self.clamp_index(layout, bounds.0),
            end: self.clamp_index(layout, bounds.1),
        };
        self.unsaved = Some(match self.unsaved {
            Some(range) => range.widen(touched),
            None => touched,
        });

        let mut skipped = 0usize;
        for tick in ticks {
            match self.slot_index(layout, tick.time) {
                Some(i) => self.slots[i].absorb(tick),
                None => skipped += 1,
            }
        }
        if skipped > 0 {
            tracing::trace!(skipped, base = self.base, "ticks outside window skipped");
        }

        self.touched_at = now;
    }

    /// Non-empty ticks in the unsaved range, in time order.
    pub fn unsaved_ticks(&self) -> Vec<Tick> {
        match self.unsaved {
            Some(range) => self.slots[range.begin..=range.end]
                .iter()
                .filter(|t| !t.is_empty())
                .copied()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Returns the unsaved ticks and marks the whole window durable.
    pub fn take_unsaved(&mut self) -> Vec<Tick> {
        let ticks = self.unsaved_ticks();
        self.unsaved = None;
        ticks
    }

    /// Builds the successor window anchored on `now` (never before the
    /// current base). Slots still covered by the new span are carried over;
    /// the successor starts fully durable.
    pub fn reanchor(&self, layout: &WindowLayout, now: i64) -> Window {
        let base = layout.anchor(now).max(self.base);
        let mut next = Window::empty(layout, base, self.touched_at);
        for slot in next.slots.iter_mut() {
            if let Some(k) = self.slot_index(layout, slot.time) {
                *slot = self.slots[k];
            }
        }
        next
    }

    /// Adds the unsaved slots that fall in `[begin, end]` into `points`,
    /// where `points[j]` is the bucket at `begin + j * alignment`.
    pub fn overlay_unsaved(
        &self,
        layout: &WindowLayout,
        begin: i64,
        end: i64,
        points: &mut [Tick],
    ) {
        let Some(range) = self.unsaved else {
            return;
        };

        for tick in &self.slots[range.begin..=range.end] {
            if tick.is_empty() || tick.time < begin || tick.time > end {
                continue;
            }
            let j = layout.alignment.buckets_between(begin, tick.time) as usize;
            if let Some(point) = points.get_mut(j) {
                point.absorb(tick);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::series_bounds;

    const T: i64 = 1_700_000_000;

    fn layout() -> WindowLayout {
        WindowLayout {
            alignment: Alignment::from_secs(10).expect("alignment"),
            left_span: 20,
            right_span: 10,
        }
    }

    fn tick(time: i64, sum: i64, count: u64) -> Tick {
        Tick { time, sum, count }
    }

    fn merged(window: &mut Window, now: i64, ticks: &[Tick]) {
        let bounds = series_bounds(ticks).expect("non-empty");
        window.merge(&layout(), now, ticks, bounds);
    }

    fn assert_range_invariant(window: &Window) {
        if let Some(r) = window.unsaved() {
            assert!(r.begin <= r.end);
            assert!(r.end < window.slots().len());
        }
    }

    #[test]
    fn test_create_anchors_left_of_now() {
        let l = layout();
        let ticks = [tick(T, 10, 2)];
        let window = Window::create(&l, T, &ticks, (T, T));

        assert_eq!(window.base(), T - 200);
        assert_eq!(window.slots().len(), 30);
        assert_eq!(window.slots()[20], tick(T, 10, 2));
        assert_eq!(window.unsaved(), Some(SaveRange { begin: 20, end: 20 }));
        assert_eq!(window.end(&l), T + 100);
    }

    #[test]
    fn test_slots_are_contiguous() {
        let window = Window::create(&layout(), T + 3, &[tick(T, 1, 1)], (T, T));
        for (i, slot) in window.slots().iter().enumerate() {
            assert_eq!(slot.time, window.base() + i as i64 * 10);
        }
    }

    #[test]
    fn test_disjoint_merges_union() {
        let l = layout();
        let mut window = Window::create(&l, T, &[tick(T - 50, 1, 1)], (T - 50, T - 50));
        merged(&mut window, T, &[tick(T - 20, 2, 1), tick(T, 3, 1)]);

        let nonempty: Vec<Tick> = window
            .slots()
            .iter()
            .filter(|t| !t.is_empty())
            .copied()
            .collect();
        assert_eq!(
            nonempty,
            vec![tick(T - 50, 1, 1), tick(T - 20, 2, 1), tick(T, 3, 1)]
        );
        assert_eq!(window.unsaved(), Some(SaveRange { begin: 15, end: 20 }));
    }

    #[test]
    fn test_overlapping_merge_adds() {
        let l = layout();
        let mut window = Window::create(&l, T, &[tick(T, 10, 2)], (T, T));
        merged(&mut window, T, &[tick(T, 7, 3)]);
        assert_eq!(window.slots()[20], tick(T, 17, 5));
    }

    #[test]
    fn test_save_range_never_shrinks() {
        let l = layout();
        let mut window = Window::create(&l, T, &[tick(T - 100, 1, 1), tick(T, 1, 1)], (T - 100, T));
        assert_eq!(window.unsaved(), Some(SaveRange { begin: 10, end: 20 }));

        merged(&mut window, T, &[tick(T - 50, 1, 1)]);
        assert_eq!(window.unsaved(), Some(SaveRange { begin: 10, end: 20 }));
    }

    #[test]
    fn test_out_of_window_ticks_are_skipped_and_range_clamped() {
        let l = layout();
        let mut window = Window::create(&l, T, &[tick(T, 1, 1)], (T, T));
        let base = window.base();

        // One tick before the window, one at its last slot.
        merged(&mut window, T, &[tick(base - 10, 99, 9), tick(base + 290, 4, 1)]);
        assert_eq!(window.slots()[29], tick(base + 290, 4, 1));
        assert_eq!(window.unsaved(), Some(SaveRange { begin: 0, end: 29 }));
        assert!(window.slots().iter().all(|t| t.sum != 99));
        assert_range_invariant(&window);
    }

    #[test]
    fn test_fits_boundary() {
        let l = layout();
        let window = Window::create(&l, T, &[tick(T, 1, 1)], (T, T));
        let base = window.base();
        assert!(window.fits(&l, base + 299));
        assert!(!window.fits(&l, base + 300));
    }

    #[test]
    fn test_reanchor_carries_overlap_and_starts_durable() {
        let l = layout();
        let mut window = Window::create(&l, T, &[tick(T - 150, 5, 1), tick(T, 10, 2)], (T - 150, T));
        let old_base = window.base();

        // Snapshot 350s past the old base arrives 250s later.
        let now = old_base + 350;
        assert!(!window.fits(&l, now));

        let evicted = window.take_unsaved();
        assert_eq!(evicted, vec![tick(T - 150, 5, 1), tick(T, 10, 2)]);

        let next = window.reanchor(&l, now);
        assert_eq!(next.base(), l.anchor(now));
        assert_eq!(next.base(), old_base + 150);
        assert_eq!(next.unsaved(), None);

        // T - 150 == old_base + 50 is before the new base; T is carried.
        assert_eq!(next.slot_index(&l, T), Some(5));
        assert_eq!(next.slots()[5], tick(T, 10, 2));
        assert!(next.slots().iter().all(|t| t.time != T - 150));
    }

    #[test]
    fn test_reanchor_never_moves_base_backwards() {
        let l = layout();
        let window = Window::create(&l, T, &[tick(T, 1, 1)], (T, T));
        let next = window.reanchor(&l, T - 1_000);
        assert_eq!(next.base(), window.base());
        assert_eq!(next.slots(), window.slots());
    }

    #[test]
    fn test_unsaved_ticks_skip_empty_slots() {
        let l = layout();
        let window = Window::create(&l, T, &[tick(T - 30, 1, 1), tick(T, 2, 1)], (T - 30, T));
        assert_eq!(window.unsaved(), Some(SaveRange { begin: 17, end: 20 }));
        assert_eq!(window.unsaved_ticks().len(), 2);
    }

    #[test]
    fn test_overlay_adds_only_unsaved_overlap() {
        let l = layout();
        let mut window = Window::create(&l, T, &[tick(T - 10, 3, 1), tick(T, 10, 2)], (T - 10, T));

        let mut points = vec![Tick::default(); 2];
        window.overlay_unsaved(&l, T - 10, T, &mut points);
        assert_eq!(points[0].sum, 3);
        assert_eq!(points[1].count, 2);

        // Once durable, the window contributes nothing.
        window.take_unsaved();
        let mut points = vec![Tick::default(); 2];
        window.overlay_unsaved(&l, T - 10, T, &mut points);
        assert!(points.iter().all(Tick::is_empty));
    }

    #[test]
    fn test_range_invariant_over_merge_sequence() {
        let l = layout();
        let mut window = Window::create(&l, T, &[tick(T, 1, 1)], (T, T));
        let base = window.base();
        for offset in [-500, 0, 80, 290, 310, -10, 150] {
            merged(&mut window, T, &[tick(base + offset, 1, 1)]);
            assert_range_invariant(&window);
        }
    }
}
