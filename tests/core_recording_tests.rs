use std::sync::Arc;
use std::thread;

use spiketab::core::AnalysisIdentity;
use spiketab::{BinaryRecording, EngineError, EventTrains, InMemoryRecording, Recording};

fn interleaved(num_samples: usize, num_channels: usize) -> Vec<f32> {
    (0..num_samples * num_channels).map(|v| v as f32).collect()
}

#[test]
fn test_binary_recording_concurrent_reads() {
    let dir = tempfile::tempdir().unwrap();
    let paths: Vec<_> = (0..2)
        .map(|s| {
            let path = dir.path().join(format!("segment-{s}.raw"));
            BinaryRecording::write_segment(&path, &interleaved(5000 + s * 100, 4)).unwrap();
            path
        })
        .collect();
    let recording: Arc<dyn Recording> =
        Arc::new(BinaryRecording::open(&paths, 30_000.0, 4, 0).unwrap());
    assert_eq!(recording.num_samples(1).unwrap(), 5100);
    assert_eq!(recording.total_samples(), 10_100);

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let recording = recording.clone();
            thread::spawn(move || {
                for i in 0..50 {
                    let start = (t * 400 + i * 7) % 4900;
                    let traces = recording.get_chunk(t % 2, Some(&[3, 1]), start, start + 100).unwrap();
                    assert_eq!(traces.num_samples(), 100);
                    assert_eq!(traces.sample(0, 0), (start * 4 + 3) as f32);
                    assert_eq!(traces.sample(99, 1), ((start + 99) * 4 + 1) as f32);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_chunk_request_errors() {
    let recording = InMemoryRecording::new(1000.0, 2, vec![interleaved(10, 2)]).unwrap();
    assert!(matches!(
        recording.get_chunk(0, None, 5, 11),
        Err(EngineError::OutOfRange { len: 10, .. })
    ));
    assert!(matches!(
        recording.get_chunk(0, Some(&[0, 2]), 0, 1),
        Err(EngineError::UnknownChannel { channel: 2, num_channels: 2 })
    ));
    assert!(matches!(
        recording.num_samples(1),
        Err(EngineError::UnknownSegment { segment: 1, num_segments: 1 })
    ));
    assert_eq!(recording.get_chunk(0, None, 10, 10).unwrap().num_samples(), 0);
}

#[test]
fn test_events_must_fit_recording() {
    let recording = InMemoryRecording::new(1000.0, 1, vec![vec![0.0; 10], vec![0.0; 5]]).unwrap();
    let inside = EventTrains::from_units(2, vec![("u", vec![(0, 9), (1, 4)])]).unwrap();
    assert!(inside.check_against(&recording).is_ok());

    let beyond = EventTrains::from_units(2, vec![("u", vec![(1, 5)])]).unwrap();
    assert!(matches!(
        beyond.check_against(&recording),
        Err(EngineError::InvalidEvents(_))
    ));

    let wrong_segments = EventTrains::new(3);
    assert!(wrong_segments.check_against(&recording).is_err());
}

#[test]
fn test_content_identity_is_stable() {
    let recording = InMemoryRecording::new(1000.0, 1, vec![vec![1.0; 10]]).unwrap();
    let events = EventTrains::from_units(1, vec![("u", vec![(0, 3)])]).unwrap();
    let other = EventTrains::from_units(1, vec![("u", vec![(0, 4)])]).unwrap();

    let a = AnalysisIdentity::from_content(&recording, &events);
    assert_eq!(a, AnalysisIdentity::from_content(&recording.clone(), &events));
    assert_ne!(a, AnalysisIdentity::from_content(&recording, &other));
    assert!(AnalysisIdentity::new("bad/name").is_err());
}
