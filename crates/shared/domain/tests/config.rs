use qhub_domain::EngineSet;
use qhub_domain::config::{AppConfig, LoggingSettings, QuotaConfig, RuntimeProfile};
use serde_json::json;

#[test]
fn config_defaults_are_sane() {
    let quota = QuotaConfig::default();
    assert_eq!(quota.engines, EngineSet::ALL);
    assert!(quota.usage_cache);
    assert_eq!(quota.group_limit(), quota.temporary_limit / 4);

    let logging = LoggingSettings::default();
    assert_eq!(logging.level, "info");
    assert!(logging.directory.is_none());
}

#[test]
fn group_limit_respects_floor_and_global() {
    let mut quota =
        QuotaConfig { temporary_limit: 100, group_limit_ratio: 0.1, group_limit_floor: 50, ..QuotaConfig::default() };
    assert_eq!(quota.group_limit(), 50);

    quota.group_limit_floor = 500;
    assert_eq!(quota.group_limit(), 100);

    quota.group_limit_ratio = 0.9;
    quota.group_limit_floor = 0;
    assert_eq!(quota.group_limit(), 90);
}

#[test]
fn group_limit_is_exact_for_large_limits() {
    let global = (1u64 << 60) + 2;
    let mut quota =
        QuotaConfig { temporary_limit: global, group_limit_ratio: 0.5, group_limit_floor: 0, ..QuotaConfig::default() };
    assert_eq!(quota.group_limit(), (1u64 << 59) + 1);

    quota.group_limit_ratio = 1.0;
    assert_eq!(quota.group_limit(), global);

    quota.temporary_limit = u64::MAX;
    assert_eq!(quota.group_limit(), u64::MAX);

    quota.group_limit_ratio = f64::NAN;
    quota.group_limit_floor = 7;
    assert_eq!(quota.group_limit(), 7);

    quota.group_limit_ratio = -3.0;
    assert_eq!(quota.group_limit(), 7);
}

#[test]
fn app_config_deserializes() {
    let raw = json!({
        "quota": { "storage_dir": "/tmp/qhub", "temporary_limit": 4096, "engines": ["document", "kv"] },
        "runtime": { "profile": "high_performance", "worker_threads": 2 },
        "logging": { "level": "debug", "json": true }
    });

    let cfg: AppConfig = serde_json::from_value(raw).expect("config deserialize");
    assert_eq!(cfg.quota.temporary_limit, 4096);
    assert_eq!(cfg.quota.engines, EngineSet::DOCUMENT | EngineSet::KEY_VALUE);
    assert_eq!(cfg.runtime.profile, RuntimeProfile::HighPerformance);
    assert_eq!(cfg.logging.level, "debug");
    assert_eq!(cfg.quota.io_threads, 4);
}

#[test]
fn unknown_engine_name_is_rejected() {
    let raw = json!({ "quota": { "engines": ["sqlite"] } });
    assert!(serde_json::from_value::<AppConfig>(raw).is_err());
}
