//! Engine-level tests driving the active media list through its public
//! surface: level ingest, tick processing, dominant-speaker arbitration
//! and the data-channel payloads receivers see.

use std::collections::HashMap;

use switchboard_media_core::{
    ActiveMediaConfig, ActiveMediaList, AudioLevelSample, DataChannelMessageBuilder,
    EndpointIdHash, SimulcastLevel, SimulcastStream, Ssrc, VideoStreamHandle,
};

const A: EndpointIdHash = 0xa;
const B: EndpointIdHash = 0xb;
const C: EndpointIdHash = 0xc;
const D: EndpointIdHash = 0xd;

const NS_PER_MS: u64 = 1_000_000;

fn at(ms: u64) -> u64 {
    ms * NS_PER_MS
}

fn video_levels(count: usize) -> Vec<SimulcastLevel> {
    (0..count as u32).map(|i| SimulcastLevel::new(9000 + 2 * i, 9001 + 2 * i)).collect()
}

fn engine(audio_ssrcs: &[Ssrc], default_last_n: u32) -> ActiveMediaList {
    let config = ActiveMediaConfig { default_last_n, ..Default::default() };
    ActiveMediaList::new(7, audio_ssrcs, &video_levels(default_last_n as usize + 3), config)
        .unwrap()
}

fn camera(ssrc: Ssrc) -> SimulcastStream {
    SimulcastStream::camera(vec![SimulcastLevel::new(ssrc, ssrc + 1)])
}

fn slides(ssrc: Ssrc) -> SimulcastStream {
    SimulcastStream::slides(vec![SimulcastLevel::new(ssrc, ssrc + 1)])
}

fn camera_handle(endpoint_id: &str, ssrc: Ssrc) -> VideoStreamHandle {
    VideoStreamHandle {
        endpoint_id: endpoint_id.to_string(),
        simulcast_stream: camera(ssrc),
        secondary_simulcast_stream: None,
        pin_ssrc: None,
    }
}

fn sample(endpoint_id_hash: EndpointIdHash, level: u8) -> AudioLevelSample {
    AudioLevelSample { endpoint_id_hash, level, ptt: false }
}

#[test]
fn a_speaker_takes_the_dominant_position_from_a_silent_incumbent() {
    let mut list = engine(&[1000, 1001], 2);
    // B joins first and seeds the dominant-speaker position, then stays
    // silent while A talks.
    assert!(list.add_audio_participant(B));
    assert!(list.add_audio_participant(A));
    assert_eq!(list.dominant_speaker(), B);

    let producer = list.level_producer();
    let mut changes = Vec::new();
    for tick in 1..=210u64 {
        let now = at(tick * 10);
        producer.push(sample(A, 80));
        let result = list.process(now);
        if result.dominant_speaker_changed {
            changes.push(now);
        }
    }

    // The switch happens on the first tick the switch window allows and
    // immediately, because the incumbent has no audible history.
    assert_eq!(changes, vec![at(1980)]);
    assert_eq!(list.dominant_speaker(), A);
    assert_eq!(list.talker_reader().dominant_speaker(), A);
}

#[test]
fn challenger_needs_three_wins_and_a_clear_margin() {
    let mut list = engine(&[1000, 1001], 2);
    assert!(list.add_audio_participant(A));
    assert!(list.add_audio_participant(B));
    let producer = list.level_producer();

    // A talks, B idles quietly; B's noise floor settles low.
    for tick in 1..=300u64 {
        producer.push(sample(A, 80));
        producer.push(sample(B, 10));
        let result = list.process(at(tick * 10));
        assert!(!result.dominant_speaker_changed);
    }
    assert_eq!(list.dominant_speaker(), A);

    // B starts shouting. Two winning ticks are not enough.
    let mut changes = Vec::new();
    for tick in 301..=303u64 {
        let now = at(tick * 10);
        producer.push(sample(B, 120));
        producer.push(sample(A, 70));
        if list.process(now).dominant_speaker_changed {
            changes.push(now);
        }
    }
    // The third consecutive win, with the margin and the switch window
    // satisfied, flips the position.
    assert_eq!(changes, vec![at(3030)]);
    assert_eq!(list.dominant_speaker(), B);

    // Law: no second switch can land before the 2 s window has passed,
    // however loud the new challenger is.
    let mut changes = Vec::new();
    for tick in 304..=520u64 {
        let now = at(tick * 10);
        producer.push(sample(A, 120));
        if list.process(now).dominant_speaker_changed {
            changes.push(now);
        }
    }
    assert_eq!(changes, vec![at(5030)]);
    assert!(at(5030) - at(3030) >= at(2000));
    assert_eq!(list.dominant_speaker(), A);
}

#[test]
fn process_is_idempotent_within_the_tick_interval() {
    let mut list = engine(&[1000, 1001], 2);
    list.add_audio_participant(B);
    list.add_audio_participant(A);
    let producer = list.level_producer();

    for tick in 1..=200u64 {
        producer.push(sample(A, 80));
        list.process(at(tick * 10));
    }
    let dominant = list.dominant_speaker();
    let talkers = list.active_talkers();

    // Re-running inside the same window is a no-op.
    let result = list.process(at(2000));
    assert!(!result.dominant_speaker_changed);
    assert!(!result.user_media_map_changed);
    let result = list.process(at(2004));
    assert!(!result.dominant_speaker_changed);
    assert_eq!(list.dominant_speaker(), dominant);
    assert_eq!(list.active_talkers(), talkers);
}

#[test]
fn dominant_speaker_switch_refreshes_the_video_rotation() {
    let mut list = engine(&[1000, 1001], 1); // video rotation capacity 2
    assert!(list.add_audio_participant(B));
    assert!(list.add_audio_participant(A));
    // Three video senders; the rotation can hold two.
    assert!(list.add_video_participant(A, camera(600), None));
    assert!(list.add_video_participant(C, camera(610), None));
    assert!(list.add_video_participant(D, camera(620), None));
    assert!(!list.is_in_active_video_list(D) || !list.is_in_active_video_list(A));

    let producer = list.level_producer();
    let mut media_map_changed = false;
    for tick in 1..=210u64 {
        producer.push(sample(A, 80));
        let result = list.process(at(tick * 10));
        media_map_changed |= result.user_media_map_changed;
    }

    // A became dominant and was hoisted to the rotation's tail.
    assert_eq!(list.dominant_speaker(), A);
    assert!(media_map_changed);
    assert!(list.is_in_active_video_list(A));
    assert!(list.video_ssrc_rewrite_map().contains_key(&A));
}

#[test]
fn screen_share_mapping_lifecycle() {
    let mut list = engine(&[1000], 3);
    let reserved = 9000; // first constructed level is reserved at build time

    assert!(list.add_video_participant(A, slides(777), None));
    let (holder, mapping) = *list.video_screen_share_ssrc_mapping().unwrap();
    assert_eq!(holder, A);
    assert_eq!(mapping.ssrc, 777);
    assert_eq!(mapping.rewrite_ssrc, reserved);

    assert!(list.remove_video_participant(A));
    assert!(list.video_screen_share_ssrc_mapping().is_none());

    // The reserved rewrite SSRC survives holders coming and going.
    assert!(list.add_video_participant(B, slides(888), None));
    assert_eq!(list.video_screen_share_ssrc_mapping().unwrap().1.rewrite_ssrc, reserved);
}

#[test]
fn last_n_message_puts_the_pin_target_first_and_skips_the_receiver() {
    let mut list = engine(&[1000], 3); // rotation capacity 4
    assert!(list.add_video_participant(D, camera(600), None));
    assert!(list.add_video_participant(C, camera(610), None));
    assert!(list.add_video_participant(B, camera(620), None));
    assert!(list.add_video_participant(A, camera(630), None));

    let mut streams = HashMap::new();
    streams.insert(A, camera_handle("endpoint-a", 630));
    streams.insert(B, camera_handle("endpoint-b", 620));
    streams.insert(C, camera_handle("endpoint-c", 610));
    streams.insert(D, camera_handle("endpoint-d", 600));

    let mut out = DataChannelMessageBuilder::new();
    assert!(list.make_last_n_list_message(3, A, D, &streams, &mut out));
    assert!(!out.has_overflowed());

    let message: serde_json::Value = serde_json::from_str(out.as_str()).unwrap();
    assert_eq!(message["colibriClass"], "LastNEndpointsChangeEvent");
    let endpoints: Vec<&str> =
        message["lastNEndpoints"].as_array().unwrap().iter().map(|v| v.as_str().unwrap()).collect();
    assert_eq!(endpoints, vec!["endpoint-d", "endpoint-c", "endpoint-b"]);
}

#[test]
fn last_n_message_counts_entries_without_a_resolvable_stream() {
    let mut list = engine(&[1000], 3);
    // E joins first (ends up deepest in the rotation walk), then B and C.
    let e: EndpointIdHash = 0xe;
    assert!(list.add_video_participant(e, camera(600), None));
    assert!(list.add_video_participant(B, camera(610), None));
    assert!(list.add_video_participant(C, camera(620), None));

    // E has no stream handle, but still consumes one of the two slots.
    let mut streams = HashMap::new();
    streams.insert(B, camera_handle("endpoint-b", 610));
    streams.insert(C, camera_handle("endpoint-c", 620));

    let mut out = DataChannelMessageBuilder::new();
    assert!(list.make_last_n_list_message(2, A, 0, &streams, &mut out));
    let message: serde_json::Value = serde_json::from_str(out.as_str()).unwrap();
    let endpoints: Vec<&str> =
        message["lastNEndpoints"].as_array().unwrap().iter().map(|v| v.as_str().unwrap()).collect();
    assert_eq!(endpoints, vec!["endpoint-b"]);
}

#[test]
fn user_media_map_carries_an_off_list_pin_on_the_receivers_pin_ssrc() {
    let mut list = engine(&[1000], 3);
    assert!(list.add_video_participant(B, camera(610), None));
    assert!(list.add_video_participant(C, camera(620), None));

    let pin_level = SimulcastLevel::new(9999, 10000);
    let mut receiver = camera_handle("endpoint-a", 630);
    receiver.pin_ssrc = Some(pin_level);

    let mut streams = HashMap::new();
    streams.insert(A, receiver);
    streams.insert(B, camera_handle("endpoint-b", 610));
    streams.insert(C, camera_handle("endpoint-c", 620));
    // D sends video but is not in the active video rotation.
    streams.insert(D, camera_handle("endpoint-d", 640));

    let rewrite_b = list.video_ssrc_rewrite_map()[&B].ssrc;
    let rewrite_c = list.video_ssrc_rewrite_map()[&C].ssrc;

    let mut out = DataChannelMessageBuilder::new();
    assert!(list.make_user_media_map_message(3, A, D, &streams, &mut out));
    assert!(!out.has_overflowed());

    let message: serde_json::Value = serde_json::from_str(out.as_str()).unwrap();
    assert_eq!(message["colibriClass"], "UserMediaMap");
    let endpoints = message["endpoints"].as_array().unwrap();
    assert_eq!(endpoints.len(), 3);

    assert_eq!(endpoints[0]["endpoint"], "endpoint-d");
    assert_eq!(endpoints[0]["ssrcs"].as_array().unwrap(), &[serde_json::json!(9999)]);
    assert_eq!(endpoints[1]["endpoint"], "endpoint-b");
    assert_eq!(endpoints[1]["ssrcs"].as_array().unwrap(), &[serde_json::json!(rewrite_b)]);
    assert_eq!(endpoints[2]["endpoint"], "endpoint-c");
    assert_eq!(endpoints[2]["ssrcs"].as_array().unwrap(), &[serde_json::json!(rewrite_c)]);
}

#[test]
fn user_media_map_reports_video_and_screen_share_rewrites_together() {
    let mut list = engine(&[1000], 3);
    // B sends camera video and slides at the same time.
    assert!(list.add_video_participant(B, camera(610), Some(slides(777))));

    let mut streams = HashMap::new();
    streams.insert(A, camera_handle("endpoint-a", 630));
    streams.insert(B, camera_handle("endpoint-b", 610));

    let rewrite_b = list.video_ssrc_rewrite_map()[&B].ssrc;
    let screen_rewrite = list.video_screen_share_ssrc_mapping().unwrap().1.rewrite_ssrc;

    let mut out = DataChannelMessageBuilder::new();
    assert!(list.make_user_media_map_message(3, A, 0, &streams, &mut out));

    let message: serde_json::Value = serde_json::from_str(out.as_str()).unwrap();
    let endpoints = message["endpoints"].as_array().unwrap();
    assert_eq!(endpoints.len(), 1);
    assert_eq!(endpoints[0]["endpoint"], "endpoint-b");
    assert_eq!(
        endpoints[0]["ssrcs"].as_array().unwrap(),
        &[serde_json::json!(rewrite_b), serde_json::json!(screen_rewrite)]
    );
}

#[test]
fn message_builders_reject_out_of_range_last_n() {
    let list = engine(&[1000], 3);
    let streams = HashMap::new();
    let mut out = DataChannelMessageBuilder::new();
    assert!(!list.make_last_n_list_message(0, A, 0, &streams, &mut out));
    assert!(!list.make_last_n_list_message(4, A, 0, &streams, &mut out));
    assert!(!list.make_user_media_map_message(0, A, 0, &streams, &mut out));
    assert!(!list.make_user_media_map_message(4, A, 0, &streams, &mut out));
}

#[test]
fn oversized_last_n_message_latches_the_overflow_flag() {
    let mut list = engine(&[1000], 3);
    assert!(list.add_video_participant(B, camera(610), None));
    assert!(list.add_video_participant(C, camera(620), None));
    assert!(list.add_video_participant(D, camera(630), None));

    let long_b = "b".repeat(400);
    let long_c = "c".repeat(400);
    let long_d = "d".repeat(400);
    let mut streams = HashMap::new();
    streams.insert(B, camera_handle(&long_b, 610));
    streams.insert(C, camera_handle(&long_c, 620));
    streams.insert(D, camera_handle(&long_d, 630));

    let mut out = DataChannelMessageBuilder::new();
    // The builder reports success with whatever fit; the caller checks
    // the overflow latch.
    assert!(list.make_last_n_list_message(3, A, 0, &streams, &mut out));
    assert!(out.has_overflowed());
    assert!(out.len() <= 1024);
}

#[test]
fn active_talkers_surface_score_noise_and_ptt() {
    let mut list = engine(&[1000, 1001], 2);
    assert!(list.add_audio_participant(A));
    let producer = list.level_producer();

    // Quiet-but-unmuted audio drags A's noise floor down.
    for tick in 1..=30u64 {
        producer.push(sample(A, 10));
        list.process(at(tick * 10));
    }
    assert!(list.active_talkers().is_empty());

    // Loud audio over a low floor clears the silence threshold.
    for tick in 31..=35u64 {
        producer.push(sample(A, 90));
        list.process(at(tick * 10));
    }
    let talkers = list.active_talkers();
    assert_eq!(talkers.len(), 1);
    assert_eq!(talkers[0].endpoint_id_hash, A);
    assert!(!talkers[0].is_ptt);
    assert!(talkers[0].score > talkers[0].noise_level);

    // Push-to-talk pins the noise floor and is reported as such.
    for tick in 36..=40u64 {
        producer.push(AudioLevelSample { endpoint_id_hash: A, level: 120, ptt: true });
        list.process(at(tick * 10));
    }
    let talkers = list.active_talkers();
    assert_eq!(talkers.len(), 1);
    assert!(talkers[0].is_ptt);

    // Snapshot reads work from another thread without touching the engine.
    let reader = list.talker_reader();
    let handle = std::thread::spawn(move || (reader.active_talkers(), reader.dominant_speaker()));
    let (seen, dominant) = handle.join().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].endpoint_id_hash, A);
    assert_eq!(dominant, A);
}

#[test]
fn rtp_header_extension_levels_are_inverted_on_ingest() {
    let mut list = engine(&[1000, 1001], 2);
    assert!(list.add_audio_participant(B));
    assert!(list.add_audio_participant(A));
    let producer = list.level_producer();

    for tick in 1..=210u64 {
        // 27 dB below overload is loud speech; out-of-range values are
        // dropped at the producer.
        producer.push_rtp_level(A, 27, false);
        producer.push_rtp_level(A, 255, false);
        list.process(at(tick * 10));
    }
    assert_eq!(list.dominant_speaker(), A);
}

#[test]
fn ingest_overflow_drops_samples_without_blocking() {
    let mut list = engine(&[1000], 2);
    assert!(list.add_audio_participant(A));
    let producer = list.level_producer();

    // Far more samples than the ingest queue holds; pushes never block.
    for _ in 0..40_000u32 {
        producer.push(sample(A, 80));
    }
    list.process(at(2000));
    assert_eq!(list.dominant_speaker(), A);

    // The queue keeps working after the overflow.
    producer.push(sample(A, 80));
    list.process(at(2010));
}
