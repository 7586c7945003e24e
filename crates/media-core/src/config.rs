//! Engine configuration.

/// Tunables for one conference's active media list.
///
/// Defaults match the bridge's deployment configuration.
#[derive(Debug, Clone)]
pub struct ActiveMediaConfig {
    /// How many video streams a receiver is subscribed to; the active
    /// video rotation holds one extra entry being phased out.
    pub default_last_n: u32,
    /// How many top-ranked speakers are refreshed in the active audio
    /// rotation per tick.
    pub audio_last_n: u32,
    /// Spread (dB) a speaker's score must keep above its noise floor to
    /// count as an active talker. Clamped to `[6, 60]` at construction.
    pub active_talker_silence_threshold_db: u32,
    /// Noise floor assumed for a participant signalling push-to-talk.
    pub ptt_noise_level: f32,
}

impl Default for ActiveMediaConfig {
    fn default() -> Self {
        Self {
            default_last_n: 5,
            audio_last_n: 3,
            active_talker_silence_threshold_db: 18,
            ptt_noise_level: 37.0,
        }
    }
}
