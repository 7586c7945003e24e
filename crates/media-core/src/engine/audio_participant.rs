//! Per-endpoint audio energy estimation.
//!
//! Each tracked endpoint keeps a ring of recent loudness samples with two
//! windows over it: the full ring (~2 s of audio at packet rate) and a
//! short window used to estimate the noise floor. Running sums over both
//! windows make every per-sample update O(1); the peak tracker decays
//! toward the long-window average when no new maximum arrives, and the
//! noise floor creeps back up when no new minimum is seen.
//!
//! A zero level is what muted participants produce; every unmuted client
//! sends non-zero levels. A fully non-zero short window therefore means
//! the participant has been unmuted for the whole window, which is the
//! only state in which its average is a trustworthy noise-floor sample.

/// Ring length: ~2 s of samples at typical packet rates.
pub(crate) const LONG_WINDOW_LEN: usize = 256;
/// Noise-estimation window (~200 ms of packets) within the ring.
pub(crate) const SHORT_WINDOW_LEN: usize = 25;

#[derive(Debug, Clone)]
pub(crate) struct AudioParticipant {
    levels: [u8; LONG_WINDOW_LEN],
    index: usize,
    index_end_short_window: usize,
    total_level_long_window: i32,
    total_level_short_window: i32,
    non_zero_levels_short_window: i32,
    pub(crate) max_recent_level: f32,
    pub(crate) noise_level: f32,
    pub(crate) ptt: bool,
}

impl AudioParticipant {
    /// Fraction of the gap to the long-window average the peak loses per tick.
    const MAX_LEVEL_DECAY: f32 = 0.01;
    /// Noise floor ramp-up per tick, ~3 dB per 3 s at a 10 ms tick.
    const NOISE_RAMPUP: f32 = 0.005;
    /// Floor corresponding to about -120 dBov.
    pub(crate) const MIN_NOISE: f32 = 6.0;
    const INITIAL_NOISE: f32 = 50.0;

    pub(crate) fn new() -> Self {
        Self {
            levels: [0; LONG_WINDOW_LEN],
            index: SHORT_WINDOW_LEN - 1,
            index_end_short_window: 0,
            total_level_long_window: 0,
            total_level_short_window: 0,
            non_zero_levels_short_window: 0,
            max_recent_level: 0.0,
            noise_level: Self::INITIAL_NOISE,
            ptt: false,
        }
    }

    /// Once-per-tick decay: the peak drifts toward the long-window
    /// average, the noise floor drifts up toward it.
    pub(crate) fn decay(&mut self) {
        let average_level_long_window =
            self.total_level_long_window as f32 / LONG_WINDOW_LEN as f32;
        self.max_recent_level -=
            (self.max_recent_level - average_level_long_window) * Self::MAX_LEVEL_DECAY;
        self.noise_level = (self.noise_level + Self::NOISE_RAMPUP).clamp(Self::MIN_NOISE, 127.0);
    }

    /// Fold one loudness sample into the energy history.
    pub(crate) fn apply_level(&mut self, level: u8, ptt: bool, ptt_noise_level: f32) {
        self.ptt = ptt;

        self.index = (self.index + 1) % LONG_WINDOW_LEN;
        let level_leaving_long_window = self.levels[self.index];
        let level_leaving_short_window = self.levels[self.index_end_short_window];
        self.index_end_short_window = (self.index_end_short_window + 1) % LONG_WINDOW_LEN;
        self.levels[self.index] = level;

        self.total_level_long_window +=
            i32::from(level) - i32::from(level_leaving_long_window);
        self.total_level_short_window +=
            i32::from(level) - i32::from(level_leaving_short_window);

        self.max_recent_level = self.max_recent_level.max(f32::from(level));

        if ptt {
            self.noise_level = ptt_noise_level;
        } else if level != 0 && self.non_zero_levels_short_window == SHORT_WINDOW_LEN as i32 {
            self.noise_level = self
                .noise_level
                .min(self.total_level_short_window as f32 / SHORT_WINDOW_LEN as f32);
        }

        if level_leaving_short_window != 0 {
            self.non_zero_levels_short_window -= 1;
        }
        if level != 0 {
            self.non_zero_levels_short_window += 1;
        }

        #[cfg(debug_assertions)]
        self.check_invariant();
    }

    /// Spread between the recent peak and the noise floor.
    pub(crate) fn score(&self) -> f32 {
        (self.max_recent_level - self.noise_level).max(0.0)
    }

    #[cfg(any(test, debug_assertions))]
    pub(crate) fn check_invariant(&self) {
        let long_sum: i32 = self.levels.iter().map(|&level| i32::from(level)).sum();
        assert_eq!(long_sum, self.total_level_long_window);

        let mut short_sum = 0i32;
        let mut non_zero = 0i32;
        let mut pos = self.index_end_short_window;
        loop {
            short_sum += i32::from(self.levels[pos]);
            if self.levels[pos] != 0 {
                non_zero += 1;
            }
            if pos == self.index {
                break;
            }
            pos = (pos + 1) % LONG_WINDOW_LEN;
        }
        assert_eq!(short_sum, self.total_level_short_window);
        assert_eq!(non_zero, self.non_zero_levels_short_window);

        let span = (self.index + LONG_WINDOW_LEN - self.index_end_short_window) % LONG_WINDOW_LEN;
        assert_eq!(span, SHORT_WINDOW_LEN - 1);

        assert!(self.max_recent_level >= 0.0);
        assert!(self.noise_level >= Self::MIN_NOISE && self.noise_level <= 127.0);
    }
}

impl Default for AudioParticipant {
    fn default() -> Self {
        Self::new()
    }
}
