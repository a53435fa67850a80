#[cfg(test)]
mod tests {
    use crate::{AppConfig, ConfigLoader};
    use std::path::PathBuf;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8081);
        assert!(config.server.api_key.is_none());
        assert!(!config.server.admin_endpoints);
        assert_eq!(config.backend.url, "http://127.0.0.1:8080");
        assert!(config.model.tool_parser.is_none());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let path = PathBuf::from("/nonexistent/tokenflow-test-config.json");
        let config = ConfigLoader::load(Some(&path)).expect("load should fall back");
        assert_eq!(config.server.port, AppConfig::default().server.port);
    }

    #[test]
    fn test_save_and_reload_round_trip() {
        let mut config = AppConfig::default();
        config.server.port = 9099;
        config.model.name = "qwen3-8b".to_string();
        config.model.tool_parser = Some("hermes".to_string());

        let path = std::env::temp_dir().join(format!(
            "tokenflow-config-test-{}.json",
            std::process::id()
        ));
        ConfigLoader::save(&config, &path).expect("save config");

        let loaded = ConfigLoader::load(Some(&path)).expect("reload config");
        assert_eq!(loaded.server.port, 9099);
        assert_eq!(loaded.model.name, "qwen3-8b");
        assert_eq!(loaded.model.tool_parser.as_deref(), Some("hermes"));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_parse_partial_config_fails_loudly() {
        // Config files are all-or-nothing; a malformed file is an error,
        // not a silent fallback.
        let err = serde_json::from_str::<AppConfig>("{\"server\": {}}");
        assert!(err.is_err());
    }
}
