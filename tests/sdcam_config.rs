use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use sdcam::SdcamConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "SDCAM_CONFIG",
        "SDCAM_ADDR",
        "SDCAM_CAMERA_URL",
        "SDCAM_BUS_ROOT",
        "SDCAM_SERIAL_ROOT",
        "SDCAM_HEALTH_INTERVAL_MS",
        "SDCAM_CAPTURE_PREFIX",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_json_file_then_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "server": { "addr": "0.0.0.0:9000" },
        "camera": { "url": "stub://front", "width": 800, "height": 600 },
        "card": {
            "bus_root": "/mnt/mmc",
            "serial_root": "/mnt/spi",
            "bus": { "freq_hz": 20000000 }
        },
        "policy": { "attempts": 4, "health_interval_ms": 2500 },
        "capture": { "prefix": "IMG", "directory": "/DCIM" },
        "stream": { "chunk_size": 4096 }
    }"#;
    file.write_all(json.as_bytes()).expect("write config");

    std::env::set_var("SDCAM_CONFIG", file.path());
    std::env::set_var("SDCAM_ADDR", "127.0.0.1:9100");
    std::env::set_var("SDCAM_HEALTH_INTERVAL_MS", "750");

    let cfg = SdcamConfig::load().expect("load config");
    assert_eq!(cfg.api_addr, "127.0.0.1:9100");
    assert_eq!(cfg.camera.url, "stub://front");
    assert_eq!(cfg.camera.width, 800);
    assert_eq!(cfg.card.bus_root, PathBuf::from("/mnt/mmc"));
    assert_eq!(cfg.card.serial_root, PathBuf::from("/mnt/spi"));
    assert_eq!(cfg.card.bus_pins.freq_hz, 20_000_000);
    assert_eq!(cfg.policy.attempts, 4);
    assert_eq!(cfg.policy.health_interval, Duration::from_millis(750));
    assert_eq!(cfg.capture.prefix, "IMG");
    assert_eq!(cfg.capture.directory, "/DCIM");
    assert_eq!(cfg.stream.chunk_size, 4096);
    assert!(!cfg.uses_memory_card());

    clear_env();
}

#[test]
fn toml_file_selects_memory_card() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
        [card]
        bus_root = "mem://"
        serial_root = "mem://"

        [policy]
        retry_backoff_ms = 10
    "#;
    file.write_all(toml.as_bytes()).expect("write config");

    let cfg = SdcamConfig::load_from(Some(file.path())).expect("load toml");
    assert!(cfg.uses_memory_card());
    assert_eq!(cfg.policy.retry_backoff, Duration::from_millis(10));
    assert_eq!(cfg.policy.attempts, 3);
}

#[test]
fn env_prefix_override_applies_without_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("SDCAM_CAPTURE_PREFIX", "SNAP");
    std::env::set_var("SDCAM_BUS_ROOT", "mem://");
    let cfg = SdcamConfig::load_from(None).expect("defaults");
    assert_eq!(cfg.capture.prefix, "SNAP");
    assert!(cfg.uses_memory_card());

    clear_env();
}

#[test]
fn invalid_health_interval_is_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("SDCAM_HEALTH_INTERVAL_MS", "soon");
    let err = SdcamConfig::load_from(None).unwrap_err();
    assert!(err.to_string().contains("SDCAM_HEALTH_INTERVAL_MS"));

    clear_env();
}

#[test]
fn zero_attempts_fail_validation() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(br#"{ "policy": { "attempts": 0 } }"#)
        .expect("write config");
    let err = SdcamConfig::load_from(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("attempts"));
}

#[test]
fn missing_file_reports_path() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let err = SdcamConfig::load_from(Some(std::path::Path::new("/nonexistent/sdcam.json")))
        .unwrap_err();
    assert!(format!("{:#}", err).contains("/nonexistent/sdcam.json"));
}
