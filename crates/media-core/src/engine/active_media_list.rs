//! Dominant-speaker detection and the active media rotations.
//!
//! One `ActiveMediaList` instance serves one conference. RTP workers push
//! per-packet audio levels through an [`AudioLevelProducer`]; the media
//! engine thread calls [`ActiveMediaList::process`] every tick, which
//! drains the ingest queue, updates the per-endpoint energy estimators,
//! ranks speakers and arbitrates the dominant-speaker position with
//! hysteresis. The engine keeps two bounded recency rotations - active
//! audio and active video - whose members own synthetic rewrite SSRCs
//! recycled from fixed pools, so every receiver sees a stable small set
//! of stream identities regardless of who is talking.
//!
//! Dominant speaker switching:
//!
//! 1. A switch is allowed at most once per two seconds.
//! 2. Per participant, the recent peak level decays toward the long-window
//!    average and the noise floor ramps up when no new minimum arrives.
//! 3. A participant's score is the spread between peak and noise floor.
//! 4. To take over, a challenger must hold the highest score three ticks
//!    in a row while the incumbent scores below 75% of the challenger's.
//!
//! All mutating entry points require `&mut self`: the single-writer
//! discipline is enforced by the type system, and the only cross-thread
//! surfaces are the ingest queue, the published talker snapshot and the
//! dominant-speaker id.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, info, warn};

use infra_common::collections::{IndexList, NodeId};
use infra_common::sync::Publish;

use crate::api::data_channel::{self, DataChannelMessageBuilder};
use crate::config::ActiveMediaConfig;
use crate::engine::audio_participant::AudioParticipant;
use crate::error::{Error, Result};
use crate::types::{
    ActiveTalker, AudioLevelSample, EndpointIdHash, SimulcastLevel, SimulcastStream, Ssrc,
    VideoStreamHandle,
};

/// Hard cap on endpoints tracked by one conference instance.
pub const MAX_PARTICIPANTS: usize = 1024;

/// Size of the synthetic SSRC slot array negotiated with receivers.
pub const SSRC_REWRITE_ARRAY_SIZE: usize = 16;

const NS_PER_MS: u64 = 1_000_000;
/// Minimum spacing between engine ticks.
const TICK_INTERVAL: u64 = 10 * NS_PER_MS;
/// A challenger must outrank everyone this many ticks in a row.
const REQUIRED_CONSECUTIVE_WINS: u32 = 3;
/// Only allow a new dominant-speaker switch after 2 s.
const MAX_SWITCH_DOMINANT_SPEAKER_EVERY: u64 = 2000 * NS_PER_MS;
/// Per-packet level samples buffered between ticks.
const INGEST_QUEUE_CAPACITY: usize = 32_768;
/// Node capacity of the audio/video recency rotations.
const ACTIVE_LIST_NODE_CAPACITY: usize = 32;
/// Published talker snapshots never exceed half the participant cap.
const MAX_ACTIVE_TALKERS: usize = MAX_PARTICIPANTS / 2;
/// One engine writer plus up to five API reader threads.
const TALKER_SNAPSHOT_SLOTS: usize = 6;

/// Outcome of one `process` tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessResult {
    /// The dominant speaker switched this tick.
    pub dominant_speaker_changed: bool,
    /// The active video rotation changed; receivers need fresh
    /// user-media-map messages.
    pub user_media_map_changed: bool,
}

/// Source-to-rewrite SSRC pair for the one endpoint sending slides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoScreenShareSsrcMapping {
    /// The sender's own screen-share SSRC.
    pub ssrc: Ssrc,
    /// The reserved SSRC it is rewritten to for every receiver.
    pub rewrite_ssrc: Ssrc,
}

#[derive(Debug, Clone)]
struct VideoParticipant {
    simulcast_stream: SimulcastStream,
    secondary_simulcast_stream: Option<SimulcastStream>,
}

impl VideoParticipant {
    fn is_sending_video(&self) -> bool {
        self.simulcast_stream.is_sending_video()
            || self
                .secondary_simulcast_stream
                .as_ref()
                .is_some_and(|stream| stream.is_sending_video())
    }
}

/// One speaker's rank entry; ordered by score for the top-K heap.
#[derive(Debug, Clone, Copy)]
struct ParticipantScore {
    endpoint_id_hash: EndpointIdHash,
    score: f32,
    noise_level: f32,
}

impl PartialEq for ParticipantScore {
    fn eq(&self, other: &Self) -> bool {
        self.score == other.score
    }
}

impl Eq for ParticipantScore {}

impl PartialOrd for ParticipantScore {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ParticipantScore {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.score.total_cmp(&other.score)
    }
}

/// Clonable handle RTP worker threads use to feed audio levels.
///
/// Pushes never block: when the ingest queue is full the sample is
/// dropped and counted.
#[derive(Clone)]
pub struct AudioLevelProducer {
    tx: Sender<AudioLevelSample>,
    dropped: Arc<AtomicU64>,
}

impl AudioLevelProducer {
    /// Queue one loudness sample (0 silent ..= 127 loudest).
    pub fn push(&self, sample: AudioLevelSample) {
        if self.tx.try_send(sample).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Queue a level as carried by the RTP audio-level header extension
    /// (negated dBov: 0 is the loudest, 127 silence). Values above 127
    /// are discarded.
    pub fn push_rtp_level(&self, endpoint_id_hash: EndpointIdHash, negated_dbov: u8, ptt: bool) {
        if negated_dbov < 128 {
            self.push(AudioLevelSample { endpoint_id_hash, level: 127 - negated_dbov, ptt });
        }
    }
}

/// Clonable handle API threads use to observe the talker state.
///
/// Reads are safe from any thread, never block the engine and never
/// observe a torn snapshot.
#[derive(Clone)]
pub struct ActiveTalkerReader {
    snapshot: Arc<Publish<Vec<ActiveTalker>, TALKER_SNAPSHOT_SLOTS>>,
    dominant_speaker_id: Arc<AtomicU64>,
}

impl ActiveTalkerReader {
    /// Endpoints currently speaking above the silence threshold.
    pub fn active_talkers(&self) -> Vec<ActiveTalker> {
        self.snapshot.read().unwrap_or_default()
    }

    /// The conference's current dominant speaker, 0 if none.
    pub fn dominant_speaker(&self) -> EndpointIdHash {
        self.dominant_speaker_id.load(Ordering::Acquire)
    }
}

/// Per-conference speaker ranking and SSRC rewrite state. See the module
/// documentation for the overall algorithm.
pub struct ActiveMediaList {
    log_id: String,

    default_last_n: usize,
    max_active_list_size: usize,
    audio_last_n: usize,
    active_talker_silence_threshold_db: f32,
    ptt_noise_level: f32,
    max_speakers: usize,

    audio_participants: HashMap<EndpointIdHash, AudioParticipant>,
    level_tx: Sender<AudioLevelSample>,
    level_rx: Receiver<AudioLevelSample>,
    dropped_levels: Arc<AtomicU64>,
    logged_dropped_levels: u64,

    audio_ssrc_pool: VecDeque<Ssrc>,
    audio_ssrc_rewrite_map: HashMap<EndpointIdHash, Ssrc>,
    active_audio_list: IndexList<EndpointIdHash>,
    initial_audio_ssrc_count: usize,

    dominant_speaker_id: Arc<AtomicU64>,
    prev_winning_dominant_speaker: EndpointIdHash,
    consecutive_dominant_speaker_wins: u32,

    video_participants: HashMap<EndpointIdHash, VideoParticipant>,
    video_ssrc_pool: VecDeque<SimulcastLevel>,
    video_feedback_ssrc_lookup: HashMap<Ssrc, Ssrc>,
    video_screen_share_ssrc: SimulcastLevel,
    video_ssrc_rewrite_map: HashMap<EndpointIdHash, SimulcastLevel>,
    reverse_video_ssrc_rewrite_map: HashMap<Ssrc, EndpointIdHash>,
    video_screen_share_ssrc_mapping: Option<(EndpointIdHash, VideoScreenShareSsrcMapping)>,
    active_video_list: IndexList<EndpointIdHash>,
    active_video_list_lookup: HashMap<EndpointIdHash, NodeId>,
    initial_video_ssrc_count: usize,

    talker_snapshot: Arc<Publish<Vec<ActiveTalker>, TALKER_SNAPSHOT_SLOTS>>,

    scratch_scores: Vec<ParticipantScore>,

    last_run_timestamp: u64,
    last_change_timestamp: u64,
}

impl ActiveMediaList {
    /// Create the engine for one conference.
    ///
    /// `audio_ssrcs` and `video_ssrcs` seed the rewrite pools and must be
    /// duplicate-free; the first video level is reserved for screen-share
    /// rewriting for the lifetime of the instance. Timestamps passed to
    /// [`process`](Self::process) are monotonic nanoseconds.
    pub fn new(
        instance_id: usize,
        audio_ssrcs: &[Ssrc],
        video_ssrcs: &[SimulcastLevel],
        config: ActiveMediaConfig,
    ) -> Result<Self> {
        let default_last_n = config.default_last_n as usize;
        let max_active_list_size = default_last_n + 1;

        if audio_ssrcs.len() > 2 * SSRC_REWRITE_ARRAY_SIZE {
            return Err(Error::invalid_config(format!(
                "{} audio ssrcs exceed the {} rewrite slots",
                audio_ssrcs.len(),
                2 * SSRC_REWRITE_ARRAY_SIZE
            )));
        }
        if video_ssrcs.len() < max_active_list_size + 2 {
            return Err(Error::invalid_config(format!(
                "{} video ssrcs cannot cover lastN {} plus screen share",
                video_ssrcs.len(),
                default_last_n
            )));
        }

        let mut seen = std::collections::HashSet::new();
        if !audio_ssrcs.iter().all(|&ssrc| seen.insert(ssrc)) {
            return Err(Error::invalid_config("duplicate audio ssrc in rewrite pool"));
        }
        let mut seen = std::collections::HashSet::new();
        if !video_ssrcs.iter().all(|level| seen.insert(level.ssrc)) {
            return Err(Error::invalid_config("duplicate video ssrc in rewrite pool"));
        }

        let mut video_ssrc_pool: VecDeque<SimulcastLevel> = video_ssrcs.iter().copied().collect();
        let video_feedback_ssrc_lookup = video_ssrcs
            .iter()
            .map(|level| (level.ssrc, level.feedback_ssrc))
            .collect();
        let video_screen_share_ssrc = video_ssrc_pool
            .pop_front()
            .ok_or_else(|| Error::invalid_config("empty video ssrc pool"))?;

        let (level_tx, level_rx) = bounded(INGEST_QUEUE_CAPACITY);
        let log_id = format!("ActiveMediaList-{}", instance_id);

        info!(
            "{}: created, {} audio ssrcs, {} video ssrcs, lastN {}, audio lastN {}",
            log_id,
            audio_ssrcs.len(),
            video_ssrcs.len(),
            default_last_n,
            config.audio_last_n
        );

        Ok(Self {
            log_id,
            default_last_n,
            max_active_list_size,
            audio_last_n: config.audio_last_n as usize,
            active_talker_silence_threshold_db: config
                .active_talker_silence_threshold_db
                .clamp(6, 60) as f32,
            ptt_noise_level: config.ptt_noise_level.clamp(AudioParticipant::MIN_NOISE, 127.0),
            max_speakers: audio_ssrcs.len(),
            audio_participants: HashMap::new(),
            level_tx,
            level_rx,
            dropped_levels: Arc::new(AtomicU64::new(0)),
            logged_dropped_levels: 0,
            audio_ssrc_pool: audio_ssrcs.iter().copied().collect(),
            audio_ssrc_rewrite_map: HashMap::new(),
            active_audio_list: IndexList::with_capacity(ACTIVE_LIST_NODE_CAPACITY),
            initial_audio_ssrc_count: audio_ssrcs.len(),
            dominant_speaker_id: Arc::new(AtomicU64::new(0)),
            prev_winning_dominant_speaker: 0,
            consecutive_dominant_speaker_wins: 0,
            video_participants: HashMap::new(),
            video_ssrc_pool,
            video_feedback_ssrc_lookup,
            video_screen_share_ssrc,
            video_ssrc_rewrite_map: HashMap::new(),
            reverse_video_ssrc_rewrite_map: HashMap::new(),
            video_screen_share_ssrc_mapping: None,
            active_video_list: IndexList::with_capacity(ACTIVE_LIST_NODE_CAPACITY),
            active_video_list_lookup: HashMap::new(),
            initial_video_ssrc_count: video_ssrcs.len(),
            talker_snapshot: Arc::new(Publish::new()),
            scratch_scores: Vec::with_capacity(MAX_PARTICIPANTS),
            last_run_timestamp: 0,
            last_change_timestamp: 0,
        })
    }

    /// Handle for RTP worker threads to push audio levels.
    pub fn level_producer(&self) -> AudioLevelProducer {
        AudioLevelProducer { tx: self.level_tx.clone(), dropped: self.dropped_levels.clone() }
    }

    /// Handle for API threads to read talker state.
    pub fn talker_reader(&self) -> ActiveTalkerReader {
        ActiveTalkerReader {
            snapshot: self.talker_snapshot.clone(),
            dominant_speaker_id: self.dominant_speaker_id.clone(),
        }
    }

    /// The current dominant speaker, 0 if none.
    pub fn dominant_speaker(&self) -> EndpointIdHash {
        self.dominant_speaker_id.load(Ordering::Relaxed)
    }

    /// Endpoints currently speaking above the silence threshold, from the
    /// last published snapshot.
    pub fn active_talkers(&self) -> Vec<ActiveTalker> {
        self.talker_snapshot.read().unwrap_or_default()
    }

    /// Endpoint-to-SSRC assignments of the active audio rotation.
    pub fn audio_ssrc_rewrite_map(&self) -> &HashMap<EndpointIdHash, Ssrc> {
        &self.audio_ssrc_rewrite_map
    }

    /// Endpoint-to-level assignments of the active video rotation.
    pub fn video_ssrc_rewrite_map(&self) -> &HashMap<EndpointIdHash, SimulcastLevel> {
        &self.video_ssrc_rewrite_map
    }

    /// Rewrite-SSRC-to-endpoint view of the video assignments.
    pub fn reverse_video_ssrc_rewrite_map(&self) -> &HashMap<Ssrc, EndpointIdHash> {
        &self.reverse_video_ssrc_rewrite_map
    }

    /// The current screen-share rewrite, if an endpoint is sending slides.
    pub fn video_screen_share_ssrc_mapping(
        &self,
    ) -> Option<&(EndpointIdHash, VideoScreenShareSsrcMapping)> {
        self.video_screen_share_ssrc_mapping.as_ref()
    }

    /// Feedback/RTX SSRC paired with a main video rewrite SSRC.
    pub fn feedback_ssrc(&self, main_ssrc: Ssrc) -> Option<Ssrc> {
        self.video_feedback_ssrc_lookup.get(&main_ssrc).copied()
    }

    pub fn is_in_active_video_list(&self, endpoint_id_hash: EndpointIdHash) -> bool {
        self.active_video_list_lookup.contains_key(&endpoint_id_hash)
    }

    /// Whether an endpoint is in the part of the active video rotation
    /// receivers are subscribed to. When the rotation holds one entry
    /// more than `default_last_n`, the head entry is being phased out and
    /// no longer counts.
    pub fn is_in_user_active_video_list(&self, endpoint_id_hash: EndpointIdHash) -> bool {
        match self.active_video_list_lookup.get(&endpoint_id_hash) {
            None => false,
            Some(&node) => {
                self.active_video_list_lookup.len() <= self.default_last_n
                    || self.active_video_list.head_node() != Some(node)
            }
        }
    }

    /// Start tracking an audio participant. The first participant becomes
    /// the initial dominant speaker. Returns `false` on a duplicate add
    /// or when no rewrite SSRC is available; in the latter case the
    /// endpoint is still energy-tracked so it can be promoted into the
    /// rotation later by eviction.
    pub fn add_audio_participant(&mut self, endpoint_id_hash: EndpointIdHash) -> bool {
        if self.audio_participants.contains_key(&endpoint_id_hash) {
            return false;
        }
        if self.audio_participants.len() >= MAX_PARTICIPANTS {
            info!("{}: participant limit reached, rejecting {}", self.log_id, endpoint_id_hash);
            return false;
        }

        self.audio_participants.insert(endpoint_id_hash, AudioParticipant::new());
        if self.dominant_speaker() == 0 {
            self.dominant_speaker_id.store(endpoint_id_hash, Ordering::Release);
        }

        let Some(ssrc) = self.audio_ssrc_pool.pop_front() else {
            info!(
                "{}: audio ssrc pool empty, endpoint {} tracked without rewrite ssrc",
                self.log_id, endpoint_id_hash
            );
            return false;
        };

        self.audio_ssrc_rewrite_map.insert(endpoint_id_hash, ssrc);
        let pushed = self.active_audio_list.push_head(endpoint_id_hash);
        debug_assert!(pushed.is_some());
        info!(
            "{}: new endpoint {}, ssrc {} added to active audio list",
            self.log_id, endpoint_id_hash, ssrc
        );

        self.debug_check_invariants();
        true
    }

    /// Stop tracking an audio participant, returning its rewrite SSRC to
    /// the pool. Returns `false` for an unknown endpoint.
    pub fn remove_audio_participant(&mut self, endpoint_id_hash: EndpointIdHash) -> bool {
        if self.audio_participants.remove(&endpoint_id_hash).is_none() {
            return false;
        }

        if let Some(ssrc) = self.audio_ssrc_rewrite_map.remove(&endpoint_id_hash) {
            self.audio_ssrc_pool.push_back(ssrc);
            self.active_audio_list.remove(&endpoint_id_hash);
            info!(
                "{}: endpoint {} removed from active audio list, ssrc {} returned",
                self.log_id, endpoint_id_hash, ssrc
            );
        }

        self.debug_check_invariants();
        true
    }

    /// Register a video participant. An endpoint sending slides takes
    /// over the screen-share rewrite slot. When the rotation is full the
    /// participant stays unlisted until promoted, unless it is the
    /// dominant speaker, which is hoisted immediately.
    pub fn add_video_participant(
        &mut self,
        endpoint_id_hash: EndpointIdHash,
        simulcast_stream: SimulcastStream,
        secondary_simulcast_stream: Option<SimulcastStream>,
    ) -> bool {
        if self.video_participants.contains_key(&endpoint_id_hash) {
            return false;
        }
        if self.video_participants.len() >= MAX_PARTICIPANTS {
            info!("{}: participant limit reached, rejecting {}", self.log_id, endpoint_id_hash);
            return false;
        }

        if simulcast_stream.is_sending_slides() {
            if let Some(ssrc) = simulcast_stream.main_ssrc() {
                self.set_screen_share_mapping(endpoint_id_hash, ssrc);
            }
        } else if let Some(secondary) = &secondary_simulcast_stream {
            if secondary.is_sending_slides() {
                if let Some(ssrc) = secondary.main_ssrc() {
                    self.set_screen_share_mapping(endpoint_id_hash, ssrc);
                }
            }
        }

        let participant =
            VideoParticipant { simulcast_stream, secondary_simulcast_stream };
        let is_sending_video = participant.is_sending_video();
        self.video_participants.insert(endpoint_id_hash, participant);

        if self.active_video_list_lookup.len() == self.max_active_list_size {
            let result = endpoint_id_hash != self.dominant_speaker()
                || self.update_active_video_list(endpoint_id_hash);
            self.debug_check_invariants();
            return result;
        }

        if is_sending_video {
            let Some(level) = self.video_ssrc_pool.pop_front() else {
                warn!(
                    "{}: video ssrc pool exhausted adding endpoint {}",
                    self.log_id, endpoint_id_hash
                );
                debug_assert!(false);
                return false;
            };
            self.video_ssrc_rewrite_map.insert(endpoint_id_hash, level);
            self.reverse_video_ssrc_rewrite_map.insert(level.ssrc, endpoint_id_hash);
        }

        match self.active_video_list.push_head(endpoint_id_hash) {
            Some(node) => {
                self.active_video_list_lookup.insert(endpoint_id_hash, node);
            }
            None => debug_assert!(false),
        }
        info!("{}: new endpoint {} added to active video list", self.log_id, endpoint_id_hash);

        let result = endpoint_id_hash != self.dominant_speaker()
            || self.update_active_video_list(endpoint_id_hash);
        self.debug_check_invariants();
        result
    }

    /// Remove a video participant, releasing its rewrite level and any
    /// screen-share mapping it holds. Returns `false` for an unknown
    /// endpoint.
    pub fn remove_video_participant(&mut self, endpoint_id_hash: EndpointIdHash) -> bool {
        if self.video_participants.remove(&endpoint_id_hash).is_none() {
            return false;
        }

        if self
            .video_screen_share_ssrc_mapping
            .is_some_and(|(holder, _)| holder == endpoint_id_hash)
        {
            self.video_screen_share_ssrc_mapping = None;
        }

        if let Some(level) = self.video_ssrc_rewrite_map.remove(&endpoint_id_hash) {
            self.reverse_video_ssrc_rewrite_map.remove(&level.ssrc);
            self.video_ssrc_pool.push_back(level);
        }

        if let Some(node) = self.active_video_list_lookup.remove(&endpoint_id_hash) {
            self.active_video_list.unlink(node);
        }
        info!("{}: endpoint {} removed from active video list", self.log_id, endpoint_id_hash);

        self.debug_check_invariants();
        true
    }

    fn set_screen_share_mapping(&mut self, endpoint_id_hash: EndpointIdHash, source_ssrc: Ssrc) {
        self.video_screen_share_ssrc_mapping = Some((
            endpoint_id_hash,
            VideoScreenShareSsrcMapping {
                ssrc: source_ssrc,
                rewrite_ssrc: self.video_screen_share_ssrc.ssrc,
            },
        ));
        info!(
            "{}: endpoint {} rewrites screen share {} -> {}",
            self.log_id, endpoint_id_hash, source_ssrc, self.video_screen_share_ssrc.ssrc
        );
    }

    /// Run one engine tick. Returns immediately when called again within
    /// the tick interval; otherwise drains queued audio levels, refreshes
    /// the ranking and the talker snapshot, and arbitrates the
    /// dominant-speaker position.
    pub fn process(&mut self, timestamp: u64) -> ProcessResult {
        let mut result = ProcessResult::default();

        if timestamp.saturating_sub(self.last_run_timestamp) < TICK_INTERVAL {
            return result;
        }
        self.last_run_timestamp = timestamp;

        self.log_ingest_overflow();
        self.update_levels();

        let current_dominant_speaker_score = self.rank_speakers();
        if self.scratch_scores.is_empty() {
            return result;
        }

        let mut heap = BinaryHeap::from(std::mem::take(&mut self.scratch_scores));
        let Some(&top_speaker) = heap.peek() else {
            return result;
        };

        let mut snapshot: Vec<ActiveTalker> = Vec::new();
        for _ in 0..self.audio_last_n {
            let Some(entry) = heap.pop() else {
                break;
            };
            self.update_active_audio_list(entry.endpoint_id_hash);

            if entry.score - entry.noise_level > self.active_talker_silence_threshold_db
                && snapshot.len() < MAX_ACTIVE_TALKERS
            {
                let is_ptt = self
                    .audio_participants
                    .get(&entry.endpoint_id_hash)
                    .is_some_and(|participant| participant.ptt);
                snapshot.push(ActiveTalker {
                    endpoint_id_hash: entry.endpoint_id_hash,
                    is_ptt,
                    score: entry.score as u8,
                    noise_level: entry.noise_level as u8,
                });
            }
        }
        self.scratch_scores = heap.into_vec();
        self.scratch_scores.clear();
        self.talker_snapshot.write(snapshot);

        // Too early for any switch: even a challenger starting its streak
        // now could not finish it before the switch window opens.
        if timestamp.saturating_sub(self.last_change_timestamp)
            + TICK_INTERVAL * u64::from(REQUIRED_CONSECUTIVE_WINS - 1)
            < MAX_SWITCH_DOMINANT_SPEAKER_EVERY
        {
            return result;
        }

        if top_speaker.endpoint_id_hash == self.prev_winning_dominant_speaker {
            self.consecutive_dominant_speaker_wins += 1;
        } else {
            self.consecutive_dominant_speaker_wins = 1;
            self.prev_winning_dominant_speaker = top_speaker.endpoint_id_hash;
        }

        let dominant_speaker = self.dominant_speaker();
        if top_speaker.endpoint_id_hash != dominant_speaker
            && ((dominant_speaker == 0 || current_dominant_speaker_score < 0.01)
                || (self.consecutive_dominant_speaker_wins >= REQUIRED_CONSECUTIVE_WINS
                    && current_dominant_speaker_score < 0.75 * top_speaker.score
                    && timestamp.saturating_sub(self.last_change_timestamp)
                        >= MAX_SWITCH_DOMINANT_SPEAKER_EVERY))
        {
            info!(
                "{}: dominant speaker switch {} (score {:.2}) -> {} (score {:.2})",
                self.log_id,
                dominant_speaker,
                current_dominant_speaker_score,
                top_speaker.endpoint_id_hash,
                top_speaker.score
            );
            self.last_change_timestamp = timestamp;
            self.dominant_speaker_id.store(top_speaker.endpoint_id_hash, Ordering::Release);
            result.dominant_speaker_changed = true;
            result.user_media_map_changed =
                self.update_active_video_list(top_speaker.endpoint_id_hash);
        }

        result
    }

    fn log_ingest_overflow(&mut self) {
        let dropped = self.dropped_levels.load(Ordering::Relaxed);
        if dropped > self.logged_dropped_levels {
            debug!(
                "{}: {} audio level samples dropped on ingest overflow",
                self.log_id,
                dropped - self.logged_dropped_levels
            );
            self.logged_dropped_levels = dropped;
        }
    }

    /// Decay every tracked endpoint, then fold in all queued samples.
    fn update_levels(&mut self) {
        for participant in self.audio_participants.values_mut() {
            participant.decay();
        }

        while let Ok(sample) = self.level_rx.try_recv() {
            let Some(participant) = self.audio_participants.get_mut(&sample.endpoint_id_hash)
            else {
                continue;
            };
            participant.apply_level(sample.level, sample.ptt, self.ptt_noise_level);
        }
    }

    /// Score every endpoint with audible history into `scratch_scores`;
    /// returns the current dominant speaker's score (0 without samples).
    ///
    /// A recently unmuted participant gets a head start: its noise floor
    /// is likely still below its real one, inflating the spread.
    fn rank_speakers(&mut self) -> f32 {
        self.scratch_scores.clear();
        let dominant_speaker = self.dominant_speaker();
        let mut current_dominant_speaker_score = 0.0f32;

        for (&endpoint_id_hash, participant) in &self.audio_participants {
            if participant.max_recent_level == 0.0 {
                continue;
            }
            let score = participant.score();
            if endpoint_id_hash == dominant_speaker {
                current_dominant_speaker_score = score;
            }
            self.scratch_scores.push(ParticipantScore {
                endpoint_id_hash,
                score,
                noise_level: participant.noise_level.max(0.0),
            });
        }

        current_dominant_speaker_score
    }

    /// Promote an endpoint to the tail of the active audio rotation,
    /// evicting the head and recycling its rewrite SSRC when the
    /// rotation is at capacity.
    fn update_active_audio_list(&mut self, endpoint_id_hash: EndpointIdHash) {
        if self.max_speakers == 0 {
            return;
        }
        if self.audio_ssrc_rewrite_map.contains_key(&endpoint_id_hash) {
            if !self.active_audio_list.remove(&endpoint_id_hash) {
                debug_assert!(false);
                return;
            }
            let pushed = self.active_audio_list.push_tail(endpoint_id_hash);
            debug_assert!(pushed.is_some());
            return;
        }

        if self.audio_ssrc_rewrite_map.len() == self.max_speakers {
            let Some(evicted) = self.active_audio_list.pop_head() else {
                debug_assert!(false);
                return;
            };
            let Some(ssrc) = self.audio_ssrc_rewrite_map.remove(&evicted) else {
                debug_assert!(false);
                return;
            };
            self.audio_ssrc_pool.push_back(ssrc);
        }

        let Some(ssrc) = self.audio_ssrc_pool.pop_front() else {
            debug_assert!(false);
            return;
        };
        self.audio_ssrc_rewrite_map.insert(endpoint_id_hash, ssrc);
        let pushed = self.active_audio_list.push_tail(endpoint_id_hash);
        debug_assert!(pushed.is_some());

        debug!(
            "{}: endpoint {}, ssrc {} promoted into active audio list",
            self.log_id, endpoint_id_hash, ssrc
        );
    }

    /// Move an endpoint to the tail of the active video rotation. At
    /// capacity the head is rotated out and its rewrite level recycled;
    /// an endpoint actually sending video claims a level from the pool.
    /// Returns whether the rotation changed.
    fn update_active_video_list(&mut self, endpoint_id_hash: EndpointIdHash) -> bool {
        if !self.video_participants.contains_key(&endpoint_id_hash) {
            return false;
        }

        if let Some(&node) = self.active_video_list_lookup.get(&endpoint_id_hash) {
            self.active_video_list.unlink(node);
            let Some(new_node) = self.active_video_list.push_tail(endpoint_id_hash) else {
                debug_assert!(false);
                return false;
            };
            self.active_video_list_lookup.insert(endpoint_id_hash, new_node);
            return true;
        }

        if self.active_video_list_lookup.len() == self.max_active_list_size {
            let Some(evicted) = self.active_video_list.pop_head() else {
                debug_assert!(false);
                return false;
            };
            self.active_video_list_lookup.remove(&evicted);
            if let Some(level) = self.video_ssrc_rewrite_map.remove(&evicted) {
                self.reverse_video_ssrc_rewrite_map.remove(&level.ssrc);
                self.video_ssrc_pool.push_back(level);
                debug!(
                    "{}: endpoint {} rotated out of active video list",
                    self.log_id, evicted
                );
            }
        }

        let is_sending_video = self
            .video_participants
            .get(&endpoint_id_hash)
            .is_some_and(|participant| participant.is_sending_video());
        if is_sending_video {
            let Some(level) = self.video_ssrc_pool.pop_front() else {
                debug_assert!(false);
                return false;
            };
            self.video_ssrc_rewrite_map.insert(endpoint_id_hash, level);
            self.reverse_video_ssrc_rewrite_map.insert(level.ssrc, endpoint_id_hash);
        }

        match self.active_video_list.push_tail(endpoint_id_hash) {
            Some(node) => {
                self.active_video_list_lookup.insert(endpoint_id_hash, node);
            }
            None => {
                debug_assert!(false);
                return false;
            }
        }
        true
    }

    /// Render the last-N endpoint list for one receiver: the pin target
    /// first if it has a stream, then the active video rotation from most
    /// to least recent, skipping the receiver itself.
    pub fn make_last_n_list_message(
        &self,
        last_n: usize,
        endpoint_id_hash: EndpointIdHash,
        pin_target_endpoint_id_hash: EndpointIdHash,
        engine_video_streams: &HashMap<EndpointIdHash, VideoStreamHandle>,
        out: &mut DataChannelMessageBuilder,
    ) -> bool {
        if last_n == 0 || last_n > self.default_last_n {
            warn!("{}: rejected last-n list request for {} entries", self.log_id, last_n);
            return false;
        }

        data_channel::make_last_n_start(out);
        let mut is_first_element = true;
        let mut count = 0usize;

        if pin_target_endpoint_id_hash != 0 {
            if let Some(stream) = engine_video_streams.get(&pin_target_endpoint_id_hash) {
                data_channel::make_last_n_append(out, &stream.endpoint_id, is_first_element);
                is_first_element = false;
                count += 1;
            }
        }

        for &entry in self.active_video_list.iter_from_tail() {
            if count >= last_n {
                break;
            }
            if entry == pin_target_endpoint_id_hash || entry == endpoint_id_hash {
                continue;
            }
            if let Some(stream) = engine_video_streams.get(&entry) {
                data_channel::make_last_n_append(out, &stream.endpoint_id, is_first_element);
                is_first_element = false;
            }
            count += 1;
        }

        data_channel::make_last_n_end(out);
        true
    }

    /// Render the endpoint-to-SSRC map for one receiver. A pin target
    /// outside the user-visible rotation is carried on the receiver's own
    /// pin SSRC; listed endpoints report their video rewrite SSRC and,
    /// for the slides sender, the screen-share rewrite SSRC.
    pub fn make_user_media_map_message(
        &self,
        last_n: usize,
        endpoint_id_hash: EndpointIdHash,
        pin_target_endpoint_id_hash: EndpointIdHash,
        engine_video_streams: &HashMap<EndpointIdHash, VideoStreamHandle>,
        out: &mut DataChannelMessageBuilder,
    ) -> bool {
        if last_n == 0 || last_n > self.default_last_n {
            warn!("{}: rejected user-media-map request for {} entries", self.log_id, last_n);
            return false;
        }

        data_channel::make_user_media_map_start(out);
        let mut added_elements = 0usize;

        let pin_target_in_user_list =
            self.is_in_user_active_video_list(pin_target_endpoint_id_hash);

        if pin_target_endpoint_id_hash != 0 && !pin_target_in_user_list {
            let receiver_stream = engine_video_streams.get(&endpoint_id_hash);
            let target_stream = engine_video_streams.get(&pin_target_endpoint_id_hash);
            if let (Some(receiver_stream), Some(target_stream)) = (receiver_stream, target_stream)
            {
                if let Some(pin_ssrc) = &receiver_stream.pin_ssrc {
                    data_channel::make_user_media_map_endpoint_start(
                        out,
                        &target_stream.endpoint_id,
                        added_elements == 0,
                    );
                    let mut ssrc_count = 0usize;
                    if target_stream.is_sending_video() {
                        data_channel::add_user_media_ssrc(out, pin_ssrc.ssrc, ssrc_count == 0);
                        ssrc_count += 1;
                    }
                    if let Some((holder, mapping)) = &self.video_screen_share_ssrc_mapping {
                        if *holder == pin_target_endpoint_id_hash {
                            data_channel::add_user_media_ssrc(
                                out,
                                mapping.rewrite_ssrc,
                                ssrc_count == 0,
                            );
                        }
                    }
                    data_channel::make_user_media_map_endpoint_end(out);
                    added_elements += 1;
                }
            }
        }

        for &entry in self.active_video_list.iter_from_tail() {
            if added_elements >= last_n {
                break;
            }
            if entry == endpoint_id_hash
                || (entry == pin_target_endpoint_id_hash && !pin_target_in_user_list)
            {
                continue;
            }
            let Some(stream) = engine_video_streams.get(&entry) else {
                continue;
            };

            data_channel::make_user_media_map_endpoint_start(
                out,
                &stream.endpoint_id,
                added_elements == 0,
            );
            let mut ssrc_count = 0usize;
            if let Some(level) = self.video_ssrc_rewrite_map.get(&entry) {
                data_channel::add_user_media_ssrc(out, level.ssrc, ssrc_count == 0);
                ssrc_count += 1;
            }
            if let Some((holder, mapping)) = &self.video_screen_share_ssrc_mapping {
                if *holder == entry {
                    data_channel::add_user_media_ssrc(out, mapping.rewrite_ssrc, ssrc_count == 0);
                }
            }
            data_channel::make_user_media_map_endpoint_end(out);
            added_elements += 1;
        }

        data_channel::make_user_media_map_end(out);
        true
    }

    #[inline]
    fn debug_check_invariants(&self) {
        #[cfg(any(test, debug_assertions))]
        self.check_invariants();
    }

    /// Structural invariants tying the rotations, rewrite maps and pools
    /// together. A violation is a bug in the engine, not a runtime
    /// condition, so this asserts.
    #[cfg(any(test, debug_assertions))]
    fn check_invariants(&self) {
        let mut count = 0usize;
        for &endpoint in self.active_audio_list.iter() {
            assert!(self.audio_ssrc_rewrite_map.contains_key(&endpoint));
            count += 1;
        }
        assert_eq!(count, self.audio_ssrc_rewrite_map.len());
        assert_eq!(
            self.audio_ssrc_pool.len() + self.audio_ssrc_rewrite_map.len(),
            self.initial_audio_ssrc_count
        );
        assert!(self.active_audio_list.len() <= self.max_speakers);

        let mut count = 0usize;
        for &endpoint in self.active_video_list.iter() {
            assert!(self.video_participants.contains_key(&endpoint));
            let node = self.active_video_list_lookup.get(&endpoint).copied();
            assert!(node.is_some_and(|node| self.active_video_list.get(node) == Some(&endpoint)));
            count += 1;
        }
        assert_eq!(count, self.active_video_list_lookup.len());
        assert!(self.active_video_list.len() <= self.max_active_list_size);

        assert_eq!(self.video_ssrc_rewrite_map.len(), self.reverse_video_ssrc_rewrite_map.len());
        for (&endpoint, level) in &self.video_ssrc_rewrite_map {
            assert!(self.video_participants.contains_key(&endpoint));
            assert!(self.active_video_list_lookup.contains_key(&endpoint));
            assert_eq!(self.reverse_video_ssrc_rewrite_map.get(&level.ssrc), Some(&endpoint));
        }
        assert_eq!(
            self.video_ssrc_pool.len() + self.video_ssrc_rewrite_map.len() + 1,
            self.initial_video_ssrc_count
        );
    }
}
