// Hysteresis over noisy per-frame counts. Opening is fast (one confident
// frame), closing is slow (a run of consecutive empty frames), and the
// published count while occupied is the mode of the recent window.

use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occupancy {
    Empty,
    Occupied,
}

pub struct StabilityFilter {
    window: VecDeque<u32>,
    capacity: usize,
    close_zero_run: usize,
    fast_open_threshold: f32,
    state: Occupancy,
    published: u32,
}

impl StabilityFilter {
    pub fn new(window_size: usize, close_zero_run: usize, fast_open_threshold: f32) -> Self {
        let capacity = window_size.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            close_zero_run: close_zero_run.clamp(1, capacity),
            fast_open_threshold,
            state: Occupancy::Empty,
            published: 0,
        }
    }

    /// Feed one frame's raw count and max detection confidence; returns the
    /// count to publish for this step.
    pub fn update(&mut self, raw_count: u32, max_confidence: f32) -> u32 {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(raw_count);

        match self.state {
            Occupancy::Empty => {
                // Sub-threshold blips never open occupancy.
                if raw_count > 0 && max_confidence >= self.fast_open_threshold {
                    self.state = Occupancy::Occupied;
                    self.published = self.window_mode();
                } else {
                    self.published = 0;
                }
            }
            Occupancy::Occupied => {
                if self.closing_run_complete() {
                    self.state = Occupancy::Empty;
                    self.published = 0;
                } else {
                    self.published = self.window_mode();
                }
            }
        }
        self.published
    }

    pub fn state(&self) -> Occupancy {
        self.state
    }

    pub fn published(&self) -> u32 {
        self.published
    }

    fn closing_run_complete(&self) -> bool {
        self.window.len() >= self.close_zero_run
            && self
                .window
                .iter()
                .rev()
                .take(self.close_zero_run)
                .all(|&c| c == 0)
    }

    /// Mode of the non-zero window values; ties go to the most recently
    /// observed tied value.
    fn window_mode(&self) -> u32 {
        let mut freq: HashMap<u32, (usize, usize)> = HashMap::new();
        for (idx, &count) in self.window.iter().enumerate() {
            if count == 0 {
                continue;
            }
            let entry = freq.entry(count).or_insert((0, 0));
            entry.0 += 1;
            entry.1 = idx;
        }
        freq.into_iter()
            .max_by_key(|&(_, (count, last_seen))| (count, last_seen))
            .map(|(value, _)| value)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> StabilityFilter {
        StabilityFilter::new(4, 3, 0.30)
    }

    #[test]
    fn opens_immediately_on_confident_frame() {
        let mut f = filter();
        let published = f.update(1, 0.9);
        assert_eq!(f.state(), Occupancy::Occupied);
        assert_eq!(published, 1);
    }

    #[test]
    fn low_confidence_blip_stays_empty() {
        let mut f = filter();
        let published = f.update(2, 0.1);
        assert_eq!(f.state(), Occupancy::Empty);
        assert_eq!(published, 0);
    }

    #[test]
    fn closes_after_zero_run() {
        let mut f = filter();
        f.update(1, 0.9);
        assert_eq!(f.update(0, 0.0), 1); // mode still 1, run incomplete
        assert_eq!(f.update(0, 0.0), 1);
        assert_eq!(f.update(0, 0.0), 0); // third zero closes
        assert_eq!(f.state(), Occupancy::Empty);
        assert_eq!(f.update(0, 0.0), 0);
    }

    #[test]
    fn mode_damps_single_frame_noise() {
        let mut f = filter();
        f.update(2, 0.9);
        f.update(2, 0.9);
        f.update(3, 0.9); // detector blip
        let published = f.update(2, 0.9);
        assert_eq!(published, 2);
    }

    #[test]
    fn mode_tie_prefers_most_recent() {
        let mut f = filter();
        f.update(2, 0.9);
        f.update(3, 0.9);
        f.update(2, 0.9);
        // Window [2, 3, 2, 3]: tie between 2 and 3, 3 seen last.
        assert_eq!(f.update(3, 0.9), 3);
    }

    #[test]
    fn sustained_count_change_wins_the_window() {
        let mut f = StabilityFilter::new(4, 3, 0.30);
        f.update(1, 0.9);
        f.update(1, 0.9);
        f.update(2, 0.9);
        f.update(2, 0.9);
        // Window [1, 1, 2, 2] -> tie, 2 more recent.
        assert_eq!(f.published(), 2);
        f.update(2, 0.9);
        assert_eq!(f.published(), 2);
    }

    #[test]
    fn window_evicts_oldest() {
        let mut f = StabilityFilter::new(3, 3, 0.30);
        f.update(5, 0.9);
        f.update(1, 0.9);
        f.update(1, 0.9);
        // 5 evicted; window [1, 1, 1].
        assert_eq!(f.update(1, 0.9), 1);
    }

    #[test]
    fn reopens_after_close() {
        let mut f = StabilityFilter::new(4, 2, 0.30);
        f.update(1, 0.9);
        f.update(0, 0.0);
        f.update(0, 0.0);
        assert_eq!(f.state(), Occupancy::Empty);
        assert_eq!(f.update(2, 0.8), 2);
        assert_eq!(f.state(), Occupancy::Occupied);
    }
}
