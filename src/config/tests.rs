use std::io::Write;

use serial_test::serial;
use tempfile::NamedTempFile;

use super::*;

#[test]
fn defaults_match_engine_defaults() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.cache, CacheSettings::default());
    assert_eq!(settings.cache.keep_unused_data_for, Duration::from_secs(60));
    assert_eq!(settings.cache.max_timer_delay.as_millis(), 2_147_483_647);
    assert_eq!(settings.logging.level, LevelFilter::INFO);
    assert_eq!(settings.logging.format, LogFormat::Compact);
}

#[test]
fn refetch_policy_accepts_flag_or_seconds() {
    let mut raw = RawSettings::default();
    raw.cache.refetch_on_mount_or_arg_change = Some(RawRefetch::Flag(true));
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.cache.refetch_on_mount_or_arg_change, RefetchPolicy::Always);

    let mut raw = RawSettings::default();
    raw.cache.refetch_on_mount_or_arg_change = Some(RawRefetch::Seconds(30));
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(
        settings.cache.refetch_on_mount_or_arg_change,
        RefetchPolicy::IfOlderThan(Duration::from_secs(30))
    );
}

#[test]
fn unknown_invalidation_behavior_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.invalidation_behavior = Some("eventually".to_string());

    let err = Settings::from_raw(raw).expect_err("invalid behaviour");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "cache.invalidation_behavior",
            ..
        }
    ));
}

#[test]
fn zero_timer_ceiling_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.max_timer_delay_ms = Some(0);
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn oversized_timer_ceiling_is_capped() {
    let mut raw = RawSettings::default();
    raw.cache.max_timer_delay_ms = Some(u64::MAX);
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.cache.max_timer_delay, MAX_TIMER_DELAY);
}

#[test]
fn invalid_log_level_is_reported() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("loud".to_string());
    let err = Settings::from_raw(raw).expect_err("invalid level");
    assert!(err.to_string().contains("logging.level"));
}

#[test]
#[serial]
fn file_values_are_loaded() {
    let mut file = NamedTempFile::with_suffix(".toml").expect("temp file");
    writeln!(
        file,
        r#"
[cache]
keep_unused_data_for_secs = 5
refetch_on_mount_or_arg_change = 120
refetch_on_focus = true
invalidation_behavior = "immediately"

[logging]
level = "debug"
json = true
"#
    )
    .expect("write config");

    let settings = load(Some(file.path())).expect("settings load");
    assert_eq!(settings.cache.keep_unused_data_for, Duration::from_secs(5));
    assert_eq!(
        settings.cache.refetch_on_mount_or_arg_change,
        RefetchPolicy::IfOlderThan(Duration::from_secs(120))
    );
    assert!(settings.cache.refetch_on_focus);
    assert_eq!(
        settings.cache.invalidation_behavior,
        InvalidationBehavior::Immediately
    );
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    assert_eq!(settings.logging.format, LogFormat::Json);
}

#[test]
#[serial]
fn missing_explicit_file_fails() {
    let result = load(Some(Path::new("/nonexistent/quarry.toml")));
    assert!(matches!(result, Err(LoadError::Build(_))));
}
