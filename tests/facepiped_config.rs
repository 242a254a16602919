use std::sync::Mutex;

use tempfile::NamedTempFile;

use facepipe::config::FacepipeConfig;
use facepipe::OverflowPolicy;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "FACEPIPE_CONFIG",
        "FACEPIPE_GALLERY_PATH",
        "FACEPIPE_SIMILARITY_THR",
        "FACEPIPE_TARGET_FPS",
        "FACEPIPE_FRAME_LIMIT",
        "FACEPIPE_QUEUE_CAPACITY",
        "FACEPIPE_DRAIN_TIMEOUT_MS",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "source": { "width": 800, "height": 600, "target_fps": 12 },
        "queues": {
            "default_capacity": 30,
            "overrides": {
                "pre_detect_q": { "capacity": 10, "policy": "drop-oldest" }
            }
        },
        "tracker": { "iou_thr": 0.75, "keep_lost_frames": 4 },
        "gallery": { "similarity_thr": 0.5, "queue_size": 12 },
        "correlation": { "timeout_ms": 300, "max_pending_frames": 32 },
        "drain_timeout_ms": 1500
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("FACEPIPE_CONFIG", file.path());
    std::env::set_var("FACEPIPE_TARGET_FPS", "25");
    std::env::set_var("FACEPIPE_GALLERY_PATH", "/tmp/gallery.json");

    let cfg = FacepipeConfig::load().expect("load config");

    assert_eq!(cfg.source.width, 800);
    assert_eq!(cfg.source.height, 600);
    // Env wins over the file.
    assert_eq!(cfg.source.target_fps, 25);
    assert_eq!(cfg.gallery.path.as_deref().unwrap().to_str(), Some("/tmp/gallery.json"));

    let spec = cfg.queues.spec_for("pre_detect_q");
    assert_eq!(spec.capacity, 10);
    assert_eq!(spec.policy, OverflowPolicy::DropOldest);
    let default_spec = cfg.queues.spec_for("hook_q");
    assert_eq!(default_spec.capacity, 30);
    assert_eq!(default_spec.policy, OverflowPolicy::Block);

    assert!((cfg.tracker.iou_thr - 0.75).abs() < 1e-6);
    assert_eq!(cfg.tracker.keep_lost_frames, 4);
    assert!((cfg.gallery.similarity_thr - 0.5).abs() < 1e-6);
    assert_eq!(cfg.gallery.queue_size, 12);
    assert_eq!(cfg.correlation.timeout_ms, 300);
    assert_eq!(cfg.correlation.max_pending_frames, 32);
    assert_eq!(cfg.drain_timeout_ms, 1500);

    clear_env();
}

#[test]
fn defaults_apply_without_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = FacepipeConfig::load().expect("load defaults");
    assert_eq!(cfg.source.width, 640);
    assert_eq!(cfg.source.height, 480);
    assert_eq!(cfg.queues.default_capacity, 30);
    assert!((cfg.tracker.iou_thr - 0.8).abs() < 1e-6);
    assert!((cfg.tracker.init_iou_thr - 0.9).abs() < 1e-6);
    assert_eq!(cfg.tracker.keep_new_frames, 2);
    assert_eq!(cfg.tracker.keep_lost_frames, 8);
    assert!(cfg.tracker.keep_past_metadata);
    assert!((cfg.gallery.similarity_thr - 0.4).abs() < 1e-6);
    assert_eq!(cfg.gallery.queue_size, 20);

    clear_env();
}

#[test]
fn invalid_file_is_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, b"{ not json").expect("write config");
    std::env::set_var("FACEPIPE_CONFIG", file.path());

    assert!(FacepipeConfig::load().is_err());

    clear_env();
}

#[test]
fn out_of_range_threshold_is_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("FACEPIPE_SIMILARITY_THR", "1.5");
    assert!(FacepipeConfig::load().is_err());

    clear_env();
}

#[test]
fn unparseable_env_override_is_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("FACEPIPE_QUEUE_CAPACITY", "lots");
    assert!(FacepipeConfig::load().is_err());

    clear_env();
}
