use std::time::Duration;

use strata_config::{
    discover_config_path, load_for_workspace, with_config_env_lock, ByteSize, StrataConfig,
    TrackingMode, STRATA_CONFIG_ENV_VAR,
};

#[test]
fn missing_config_uses_defaults() {
    with_config_env_lock(|| {
        std::env::remove_var(STRATA_CONFIG_ENV_VAR);
        let temp = tempfile::tempdir().unwrap();
        let (config, path) = load_for_workspace(temp.path()).unwrap();
        assert!(path.is_none());
        assert_eq!(config, StrataConfig::default());
        assert_eq!(config.indexing.dependency_tracking, TrackingMode::Enabled);
        assert_eq!(config.indexing.max_processor_rounds, 2);
        assert_eq!(config.indexing.prefetch.buffer_budget_bytes, ByteSize(1024 * 1024));
        assert_eq!(config.indexing.attributes.write_delay(), Duration::from_millis(500));
    });
}

#[test]
fn strata_toml_is_preferred_over_hidden_file() {
    with_config_env_lock(|| {
        std::env::remove_var(STRATA_CONFIG_ENV_VAR);
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(
            temp.path().join(".strata.toml"),
            "[indexing]\ndependency_tracking = \"disabled\"\n",
        )
        .unwrap();
        std::fs::write(
            temp.path().join("strata.toml"),
            "[indexing]\ndependency_tracking = \"within_project\"\n\n[indexing.prefetch]\nbuffer_budget_bytes = \"2MiB\"\nthreads = 3\n",
        )
        .unwrap();

        let (config, path) = load_for_workspace(temp.path()).unwrap();
        assert!(path.unwrap().ends_with("strata.toml"));
        assert_eq!(config.indexing.dependency_tracking, TrackingMode::WithinProject);
        assert_eq!(config.indexing.prefetch.buffer_budget_bytes, ByteSize(2 * 1024 * 1024));
        assert_eq!(config.indexing.prefetch.threads, Some(3));
        assert!(config.indexing.prefetch.enabled);
    });
}

#[test]
fn env_var_overrides_discovery() {
    with_config_env_lock(|| {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("strata.toml"), "").unwrap();
        std::fs::write(temp.path().join("custom.toml"), "[logging]\nlevel = \"debug\"\n").unwrap();

        std::env::set_var(STRATA_CONFIG_ENV_VAR, "custom.toml");
        let discovered = discover_config_path(temp.path());
        let loaded = load_for_workspace(temp.path());
        std::env::remove_var(STRATA_CONFIG_ENV_VAR);

        assert!(discovered.unwrap().ends_with("custom.toml"));
        assert_eq!(loaded.unwrap().0.logging.level, "debug");
    });
}

#[test]
fn unknown_keys_are_rejected() {
    let err = StrataConfig::load_from_str("[indexing]\nmax_rounds = 3\n").unwrap_err();
    assert!(err.to_string().contains("unknown field"), "{err}");
}
