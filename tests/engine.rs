//! Control-plane integration tests against the public `Engine` API.
//!
//! These never call `Engine::start`, since that opens a real `cpal`
//! output device and would make the suite depend on the host having one.
//! The real-time mixing scenarios (resampling, looping, mute ramps,
//! streaming underrun) are exercised directly against `Mixer::process`
//! in `src/mixer.rs`'s own test module, which can drive the callback
//! path without a device.

use std::sync::{Arc, Once};

use trackmix::{AudioSource, EngineConfig, LoadOptions, LoudnessMethod, PlayOptions, TrackId};

static TRACING_INIT: Once = Once::new();

/// Route the engine's `tracing` output to the test harness's captured
/// stdout, the same `EnvFilter::from_default_env` setup
/// `nethercore-systems-nethercore`'s and `ampactor-sonido`'s player
/// binaries use, so a failing test can be re-run with `RUST_LOG=trace`.
fn init_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

fn sine(frames: usize, freq: f32, rate: u32) -> Vec<f32> {
    (0..frames)
        .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / rate as f32).sin())
        .collect()
}

fn test_engine(max_tracks: usize) -> trackmix::Engine {
    init_tracing();
    trackmix::Engine::new(EngineConfig {
        max_tracks,
        ..Default::default()
    })
}

#[test]
fn load_track_replaces_a_conflicting_id_instead_of_rejecting_it() {
    let engine = test_engine(8);
    let id = TrackId::new("a");
    let first = AudioSource::BufferMono(Arc::from(sine(1024, 440.0, 48_000)), 48_000);
    let second = AudioSource::BufferMono(Arc::from(sine(2048, 220.0, 44_100)), 44_100);
    engine.load_track(id.clone(), first, LoadOptions::default()).unwrap();
    engine.load_track(id.clone(), second, LoadOptions::default()).unwrap();

    assert_eq!(engine.get_track_count(), 1);
    let info = engine.get_track_info(&id).unwrap();
    assert!((info.sample_rate_ratio - 44_100.0 / info.engine_sample_rate as f64).abs() < 1e-9);
    assert_eq!(info.sample_rate, 44_100);
}

#[test]
fn load_track_rejects_over_capacity() {
    let engine = test_engine(1);
    let source = AudioSource::BufferMono(Arc::from(sine(256, 440.0, 48_000)), 48_000);
    engine.load_track(TrackId::new("one"), source.clone(), LoadOptions::default()).unwrap();
    let err = engine.load_track(TrackId::new("two"), source, LoadOptions::default()).unwrap_err();
    assert!(matches!(err, trackmix::EngineError::CapacityExceeded { .. }));
}

#[test]
fn unload_then_query_reports_not_found() {
    let engine = test_engine(8);
    let id = TrackId::new("gone");
    let source = AudioSource::BufferMono(Arc::from(sine(256, 440.0, 48_000)), 48_000);
    engine.load_track(id.clone(), source, LoadOptions::default()).unwrap();
    engine.unload_track(&id).unwrap();

    assert!(matches!(engine.get_track_info(&id), Err(trackmix::EngineError::NotFound(_))));
    assert!(matches!(engine.unload_track(&id), Err(trackmix::EngineError::NotFound(_))));
}

#[test]
fn play_before_start_reports_not_running() {
    let engine = test_engine(8);
    let id = TrackId::new("t");
    let source = AudioSource::BufferMono(Arc::from(sine(256, 440.0, 48_000)), 48_000);
    engine.load_track(id.clone(), source, LoadOptions::default()).unwrap();

    let err = engine.play(&id, PlayOptions::default()).unwrap_err();
    assert!(matches!(err, trackmix::EngineError::EngineNotRunning));
}

#[test]
fn set_volume_rejects_negative() {
    let engine = test_engine(8);
    let id = TrackId::new("t");
    let source = AudioSource::BufferMono(Arc::from(sine(256, 440.0, 48_000)), 48_000);
    engine.load_track(id.clone(), source, LoadOptions::default()).unwrap();
    assert!(matches!(engine.set_volume(&id, -1.0), Err(trackmix::EngineError::InvalidArgument(_))));
}

#[test]
fn set_speed_rejects_non_positive() {
    let engine = test_engine(8);
    let id = TrackId::new("t");
    let source = AudioSource::BufferMono(Arc::from(sine(256, 440.0, 48_000)), 48_000);
    engine.load_track(id.clone(), source, LoadOptions::default()).unwrap();
    assert!(matches!(engine.set_speed(&id, 0.0), Err(trackmix::EngineError::InvalidArgument(_))));
    assert!(matches!(engine.set_speed(&id, -2.0), Err(trackmix::EngineError::InvalidArgument(_))));
}

#[test]
fn seek_rejects_negative_position() {
    let engine = test_engine(8);
    let id = TrackId::new("t");
    let source = AudioSource::BufferMono(Arc::from(sine(256, 440.0, 48_000)), 48_000);
    engine.load_track(id.clone(), source, LoadOptions::default()).unwrap();
    assert!(matches!(engine.seek(&id, -0.1), Err(trackmix::EngineError::InvalidArgument(_))));
}

#[test]
fn get_track_info_reports_decoded_metadata() {
    let engine = test_engine(8);
    let id = TrackId::new("info");
    let samples = sine(48_000, 440.0, 48_000); // exactly one second
    engine
        .load_track(
            id.clone(),
            AudioSource::BufferMono(Arc::from(samples), 48_000),
            LoadOptions {
                initial_volume: 0.6,
                ..Default::default()
            },
        )
        .unwrap();

    let info = engine.get_track_info(&id).unwrap();
    assert_eq!(info.id, id);
    assert!((info.duration_seconds - 1.0).abs() < 1e-6);
    assert!((info.volume - 0.6).abs() < 1e-6);
    assert_eq!(info.speed, 1.0);
    assert!(!info.loop_enabled);
    assert!(!info.muted);
    assert_eq!(info.underrun_count, 0);
}

#[test]
fn list_and_count_reflect_loaded_tracks() {
    let engine = test_engine(8);
    assert_eq!(engine.get_track_count(), 0);
    for name in ["a", "b", "c"] {
        engine
            .load_track(TrackId::new(name), AudioSource::BufferMono(Arc::from(sine(256, 440.0, 48_000)), 48_000), LoadOptions::default())
            .unwrap();
    }
    assert_eq!(engine.get_track_count(), 3);
    let mut listed: Vec<String> = engine.list_tracks().iter().map(|t| t.as_str().to_string()).collect();
    listed.sort();
    assert_eq!(listed, vec!["a", "b", "c"]);
    // Nothing has been told to play, so none are active yet.
    assert!(engine.get_playing_tracks().is_empty());
    assert!(engine.get_paused_tracks().is_empty());
}

#[test]
fn match_loudness_scales_quieter_track_up() {
    let engine = test_engine(8);
    let loud = TrackId::new("loud");
    let quiet = TrackId::new("quiet");
    engine
        .load_track(loud.clone(), AudioSource::BufferMono(Arc::from(vec![1.0f32; 1000]), 48_000), LoadOptions::default())
        .unwrap();
    engine
        .load_track(quiet.clone(), AudioSource::BufferMono(Arc::from(vec![0.25f32; 1000]), 48_000), LoadOptions::default())
        .unwrap();

    let (gain_loud, gain_quiet) = engine.match_loudness(&loud, &quiet, 0.5, LoudnessMethod::Rms).unwrap();
    assert!(gain_quiet > gain_loud, "quieter track should receive the larger gain");
    assert!((engine.get_track_info(&loud).unwrap().volume - gain_loud).abs() < 1e-6);
    assert!((engine.get_track_info(&quiet).unwrap().volume - gain_quiet).abs() < 1e-6);
}

#[test]
fn load_streaming_from_missing_file_returns_decode_failed() {
    let engine = test_engine(8);
    let id = TrackId::new("missing-file");
    let result = engine.load_track(
        id,
        AudioSource::File("/nonexistent/path/does-not-exist.wav".into()),
        LoadOptions {
            streaming: true,
            ..Default::default()
        },
    );
    assert!(matches!(result, Err(trackmix::EngineError::DecodeFailed { .. })));
}

#[test]
fn crossfade_before_start_fails_on_the_play_half() {
    let engine = test_engine(8);
    let a = TrackId::new("a");
    let b = TrackId::new("b");
    engine.load_track(a.clone(), AudioSource::BufferMono(Arc::from(sine(256, 440.0, 48_000)), 48_000), LoadOptions::default()).unwrap();
    engine.load_track(b.clone(), AudioSource::BufferMono(Arc::from(sine(256, 440.0, 48_000)), 48_000), LoadOptions::default()).unwrap();

    let err = engine.crossfade(&a, &b, 0.5, None, None, None).unwrap_err();
    assert!(matches!(err, trackmix::EngineError::EngineNotRunning));
}

#[test]
fn register_position_callback_rejects_unknown_track() {
    let engine = test_engine(8);
    let id = TrackId::new("ghost");
    let err = engine.register_position_callback(&id, 1.0, 0.05, Box::new(|_, _| {})).unwrap_err();
    assert!(matches!(err, trackmix::EngineError::NotFound(_)));
}

#[test]
fn remove_and_clear_position_callbacks_are_idempotent() {
    let engine = test_engine(8);
    let id = TrackId::new("t");
    engine.load_track(id.clone(), AudioSource::BufferMono(Arc::from(sine(256, 440.0, 48_000)), 48_000), LoadOptions::default()).unwrap();
    engine.register_position_callback(&id, 1.0, 0.05, Box::new(|_, _| {})).unwrap();

    assert_eq!(engine.get_position_callback_stats().active_registrations, 1);
    engine.remove_position_callback(&id, 1.0).unwrap();
    assert_eq!(engine.get_position_callback_stats().active_registrations, 0);

    // removing again, or clearing an already-empty registry, is a no-op
    assert!(engine.remove_position_callback(&id, 1.0).is_ok());
    assert!(engine.clear_all_position_callbacks().is_ok());
}

#[test]
fn global_position_listener_can_be_added_and_removed() {
    let engine = test_engine(8);
    let token = engine.add_global_position_listener(Box::new(|_, _| {})).unwrap();
    assert!(engine.remove_global_position_listener(token).is_ok());
}

#[test]
fn crossfade_without_explicit_to_volume_applies_loudness_matching() {
    let engine = test_engine(8);
    let a = TrackId::new("a");
    let b = TrackId::new("quiet-b");
    engine.load_track(a.clone(), AudioSource::BufferMono(Arc::from(vec![1.0f32; 1000]), 48_000), LoadOptions::default()).unwrap();
    engine.load_track(b.clone(), AudioSource::BufferMono(Arc::from(vec![0.25f32; 1000]), 48_000), LoadOptions::default()).unwrap();

    // Fails at the play half (no device), but loudness matching already
    // ran and set `b`'s target volume before that failure.
    let err = engine.crossfade(&a, &b, 0.2, None, None, None).unwrap_err();
    assert!(matches!(err, trackmix::EngineError::EngineNotRunning));
    assert!(engine.get_track_info(&b).unwrap().volume > 1.0, "quiet track should have been boosted");
}

#[test]
fn crossfade_with_explicit_to_volume_skips_loudness_matching() {
    let engine = test_engine(8);
    let a = TrackId::new("a");
    let b = TrackId::new("b");
    engine.load_track(a.clone(), AudioSource::BufferMono(Arc::from(sine(256, 440.0, 48_000)), 48_000), LoadOptions::default()).unwrap();
    engine.load_track(b.clone(), AudioSource::BufferMono(Arc::from(sine(256, 440.0, 48_000)), 48_000), LoadOptions::default()).unwrap();

    let err = engine.crossfade(&a, &b, 0.2, Some(0.42), Some(true), None).unwrap_err();
    assert!(matches!(err, trackmix::EngineError::EngineNotRunning));
    // target volume isn't applied until `play`'s command is drained by a
    // running mixer, but `check_can_play`/`play` never touched `b`'s
    // target directly here since it fails before enqueuing — the
    // loudness path's side effect (target_volume mutation) is what this
    // test rules out.
    assert!((engine.get_track_info(&b).unwrap().volume - 1.0).abs() < 1e-6);
}
