use qhub_logger::{LevelFilter, Logger, LoggerError, parse_level, parse_rotation};

#[test]
fn rejected_settings_leave_the_global_subscriber_free() {
    for bad in ["verbose", "info,debug", "warning!"] {
        assert!(
            matches!(parse_level(bad), Err(LoggerError::InvalidConfiguration { .. })),
            "level {bad:?} should be rejected"
        );
    }
    for bad in ["weekly", "", "daily-ish"] {
        assert!(
            matches!(parse_rotation(bad), Err(LoggerError::InvalidConfiguration { .. })),
            "rotation {bad:?} should be rejected"
        );
    }

    let err = Logger::builder()
        .name("qhub-init")
        .env_filter("qhub_quota=loudest")
        .init()
        .expect_err("malformed filter");
    assert!(matches!(err, LoggerError::InvalidConfiguration { .. }));

    let err = Logger::builder().name("qhub-init").console(false).init().expect_err("no layers");
    assert!(matches!(err, LoggerError::InvalidConfiguration { .. }));

    let err = Logger::builder().name("  ").init().expect_err("blank name");
    assert!(matches!(err, LoggerError::InvalidConfiguration { .. }));

    // None of the failures above installed anything.
    let _logger = Logger::builder()
        .name("qhub-init")
        .level(parse_level("error").expect("known level"))
        .init()
        .expect("first valid init should succeed");

    let err = Logger::builder()
        .name("qhub-init-again")
        .level(LevelFilter::TRACE)
        .init()
        .expect_err("second init should fail");
    assert!(
        matches!(err, LoggerError::Subscriber { .. }),
        "expected subscriber error for second init, got {err:?}"
    );
}
