use agent_gateway::AppError;

#[test]
fn display_prefixes_variant() {
    let cases = [
        (AppError::Config("bad".into()), "config: bad"),
        (AppError::Admission("full".into()), "admission denied: full"),
        (
            AppError::RunnerUnavailable("no command".into()),
            "runner unavailable: no command",
        ),
        (AppError::NotFound("s1".into()), "not found: s1"),
        (AppError::PathViolation("..".into()), "path violation: .."),
    ];
    for (err, expected) in cases {
        assert_eq!(err.to_string(), expected);
    }
}

#[test]
fn io_errors_convert() {
    let err: AppError = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe").into();
    assert!(matches!(err, AppError::Io(ref msg) if msg.contains("pipe")));
}

#[test]
fn json_errors_are_protocol_errors() {
    let parse = serde_json::from_str::<serde_json::Value>("{").expect_err("invalid");
    let err: AppError = parse.into();
    assert!(matches!(err, AppError::Protocol(_)));
}

#[test]
fn toml_errors_are_config_errors() {
    let parse = toml::from_str::<toml::Value>("= nope").expect_err("invalid");
    let err: AppError = parse.into();
    assert!(matches!(err, AppError::Config(_)));
}
