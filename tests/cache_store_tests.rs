use std::fs;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use serde_json::json;
use spiketab::cache::{CacheKey, EntryMeta, StoredExtension};
use spiketab::{
    AnalysisIdentity, Analyzer, BinaryRecording, ComputeContext, EngineError, EventTrains,
    ExtensionCache, ExtensionData, ExtensionDescriptor, ExtensionRegistry, FolderBackend,
    InMemoryRecording, NdArray,
};

fn registry(counter: Arc<AtomicUsize>) -> Arc<ExtensionRegistry> {
    let registry = Arc::new(ExtensionRegistry::new());
    let c = counter.clone();
    registry
        .register(ExtensionDescriptor::new("base").with_compute_fn(move |ctx: &ComputeContext<'_>| {
            c.fetch_add(1, Ordering::SeqCst);
            let traces = ctx.recording().get_chunk(0, None, 0, 10)?;
            Ok(ExtensionData::new()
                .with_array("head", NdArray::vector(traces.data().iter().map(|&v| f64::from(v)).collect()))
                .with_attr("label", json!("base")))
        }))
        .unwrap();
    registry
        .register(
            ExtensionDescriptor::new("derived")
                .depends_on("base")
                .with_compute_fn(move |ctx: &ComputeContext<'_>| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let head = ctx.dependency("base")?.require_array("head")?;
                    Ok(ExtensionData::new()
                        .with_array("total", NdArray::vector(vec![head.data().iter().sum()])))
                }),
        )
        .unwrap();
    registry
}

fn open(root: &std::path::Path, registry: Arc<ExtensionRegistry>) -> Analyzer {
    let recording = InMemoryRecording::new(100.0, 1, vec![(0..100).map(|i| i as f32).collect()]).unwrap();
    Analyzer::builder(Arc::new(recording), Arc::new(EventTrains::new(1)))
        .identity(AnalysisIdentity::new("durable").unwrap())
        .registry(registry)
        .cache(Arc::new(ExtensionCache::folder(root).unwrap()))
        .build()
        .unwrap()
}

#[test]
fn test_results_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let counter = Arc::new(AtomicUsize::new(0));

    let first = open(dir.path(), registry(counter.clone()));
    let total = first.get("derived", None).unwrap();
    assert_eq!(total.array("total").unwrap().data(), &[45.0]);
    assert_eq!(counter.load(Ordering::SeqCst), 2);
    drop(first);

    let reopened = open(dir.path(), registry(counter.clone()));
    assert_eq!(reopened.computed_extensions().unwrap(), vec!["base", "derived"]);
    let again = reopened.get("derived", None).unwrap();
    assert_eq!(again, total);
    assert_eq!(counter.load(Ordering::SeqCst), 2, "nothing recomputed after restart");
    assert_eq!(reopened.metrics().get("derived").unwrap().cache_hits(), 1);
}

#[test]
fn test_layout_is_self_describing() {
    let dir = tempfile::tempdir().unwrap();
    let analyzer = open(dir.path(), registry(Arc::new(AtomicUsize::new(0))));
    analyzer.get("derived", None).unwrap();

    let entry = dir.path().join("durable").join("extensions").join("derived");
    let sidecar: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(entry.join("sidecar.json")).unwrap()).unwrap();
    assert_eq!(sidecar["extension"], "derived");
    assert_eq!(sidecar["identity"], "durable");
    assert_eq!(sidecar["format_version"], 1);
    assert_eq!(sidecar["schema_version"], 1);
    assert!(sidecar["param_hash"].as_str().unwrap().len() == 64);
    assert!(sidecar["upstream"]["base"].is_string());
    assert!(sidecar["computed_at"].is_string());

    let payload: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(entry.join("payload.json")).unwrap()).unwrap();
    assert_eq!(payload["arrays"][0]["key"], "total");
    assert_eq!(payload["arrays"][0]["shape"], json!([1]));
    assert!(dir.path().join("durable").join("analysis.json").is_file());
}

#[test]
fn test_corrupted_entry_is_recomputed() {
    let dir = tempfile::tempdir().unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    let analyzer = open(dir.path(), registry(counter.clone()));
    let original = analyzer.get("base", None).unwrap();

    let array = dir
        .path()
        .join("durable")
        .join("extensions")
        .join("base")
        .join("array-000.f64");
    fs::write(&array, [0u8; 80]).unwrap();

    let reopened = open(dir.path(), registry(counter.clone()));
    let recomputed = reopened.get("base", None).unwrap();
    assert_eq!(recomputed, original);
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[test]
fn test_unreadable_sidecar_is_a_miss() {
    let dir = tempfile::tempdir().unwrap();
    let analyzer = open(dir.path(), registry(Arc::new(AtomicUsize::new(0))));
    analyzer.get("base", None).unwrap();

    let sidecar = dir
        .path()
        .join("durable")
        .join("extensions")
        .join("base")
        .join("sidecar.json");
    fs::write(&sidecar, "{ not json").unwrap();

    assert!(!analyzer.has("base").unwrap());
    assert!(analyzer.computed_extensions().unwrap().is_empty());
}

#[test]
fn test_stale_upstream_is_recomputed() {
    let dir = tempfile::tempdir().unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    let analyzer = open(dir.path(), registry(counter.clone()));
    analyzer.get("derived", None).unwrap();

    // rewrite the dependent's sidecar as if computed from another upstream
    let backend = FolderBackend::open(dir.path()).unwrap();
    let sidecar = backend
        .entry_dir(analyzer.identity(), "derived")
        .join("sidecar.json");
    let mut meta: EntryMeta = serde_json::from_str(&fs::read_to_string(&sidecar).unwrap()).unwrap();
    meta.upstream.insert("base".to_string(), "0".repeat(64));
    fs::write(&sidecar, serde_json::to_string(&meta).unwrap()).unwrap();

    let reopened = open(dir.path(), registry(counter.clone()));
    reopened.get("derived", None).unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 3);
}

#[test]
fn test_concurrent_stores_to_one_key() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(ExtensionCache::folder(dir.path()).unwrap());
    let identity = AnalysisIdentity::new("race").unwrap();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let cache = cache.clone();
            let identity = identity.clone();
            thread::spawn(move || {
                let key = CacheKey::new(identity, "shared", format!("{i:064}"));
                let entry = StoredExtension {
                    meta: EntryMeta::new(&key, json!({"i": i}), 1),
                    payload: Arc::new(
                        ExtensionData::new().with_array("v", NdArray::vector(vec![i as f64; 256])),
                    ),
                };
                for _ in 0..5 {
                    cache.store(&entry).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let stored = cache.peek(&identity, "shared").unwrap().unwrap();
    let v = stored.payload.array("v").unwrap();
    assert_eq!(v.len(), 256);
    assert_eq!(stored.meta.params["i"].as_f64(), Some(v.data()[0]));
    assert_eq!(cache.computed(&identity).unwrap(), vec!["shared"]);
}

#[test]
fn test_readers_never_see_a_mixed_entry() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(ExtensionCache::folder(dir.path()).unwrap());
    let identity = AnalysisIdentity::new("readers").unwrap();
    let entry = |i: u32| {
        let key = CacheKey::new(identity.clone(), "shared", format!("{i:064}"));
        StoredExtension {
            meta: EntryMeta::new(&key, json!({"i": i}), 1),
            payload: Arc::new(
                ExtensionData::new().with_array("v", NdArray::vector(vec![f64::from(i); 64])),
            ),
        }
    };
    let first = entry(1);
    let second = entry(2);
    cache.store(&first).unwrap();

    let done = AtomicBool::new(false);
    let reads = AtomicUsize::new(0);
    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                while !done.load(Ordering::Acquire) {
                    let stored = cache
                        .peek(&identity, "shared")
                        .unwrap()
                        .expect("entry disappeared while being replaced");
                    let v = stored.payload.array("v").unwrap();
                    assert_eq!(stored.meta.params["i"].as_f64(), Some(v.data()[0]));
                    assert!(v.data().iter().all(|&x| x == v.data()[0]));
                    reads.fetch_add(1, Ordering::Relaxed);
                }
            });
        }
        for round in 0..200 {
            let next = if round % 2 == 0 { &second } else { &first };
            cache.store(next).unwrap();
        }
        done.store(true, Ordering::Release);
    });

    assert!(reads.load(Ordering::Relaxed) > 0);
    assert!(cache.peek(&identity, "shared").unwrap().is_some());
    assert_eq!(cache.computed(&identity).unwrap(), vec!["shared"]);
}

#[test]
fn test_rewritten_recording_cannot_reuse_identity() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data").join("seg0.raw");
    let store = dir.path().join("store");
    let counter = Arc::new(AtomicUsize::new(0));
    let build = || {
        let recording = BinaryRecording::open(&[&data], 100.0, 1, 0).unwrap();
        Analyzer::builder(Arc::new(recording), Arc::new(EventTrains::new(1)))
            .identity(AnalysisIdentity::new("rewritten").unwrap())
            .registry(registry(counter.clone()))
            .cache(Arc::new(ExtensionCache::folder(&store).unwrap()))
            .build()
    };

    BinaryRecording::write_segment(&data, &[1.0; 100]).unwrap();
    let first = build().unwrap();
    first.get("base", None).unwrap();
    drop(first);

    // same length, different samples
    BinaryRecording::write_segment(&data, &[2.0; 100]).unwrap();
    let err = build().err().unwrap();
    assert!(matches!(err, EngineError::IdentityConflict { .. }));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}
