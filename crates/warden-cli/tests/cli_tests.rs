#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use clap::Parser;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use warden_cli::commands::{describe_permissions, render_config};
    use warden_cli::{Cli, services};
    use warden_config::WardenConfig;
    use warden_core::{CallMessage, HostSignal, PluginCall, WardenError};
    use warden_events::DeliveryPolicy;
    use warden_sandbox::{Envelope, PluginApi, PluginSandbox, PluginScript, PluginSource};

    struct Idle;

    #[async_trait]
    impl PluginScript for Idle {
        async fn activate(&self, _api: PluginApi) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn config_in(dir: &std::path::Path) -> WardenConfig {
        let mut config = WardenConfig::default();
        config.filesystem.root = dir.join("plugins");
        config.storage.backend = "memory".into();
        config
    }

    // ── Argument parsing ───────────────────────────────────────

    #[test]
    fn test_parse_run_command() {
        let cli = Cli::try_parse_from([
            "warden",
            "run",
            "plugin.wasm",
            "--id",
            "notes",
            "-p",
            "storage.*",
            "--permission",
            "filesystem.read:/notes",
        ]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_run_requires_id() {
        assert!(Cli::try_parse_from(["warden", "run", "plugin.wasm"]).is_err());
    }

    #[test]
    fn test_verbose_conflicts_with_quiet() {
        assert!(Cli::try_parse_from(["warden", "-v", "-q", "version"]).is_err());
    }

    #[test]
    fn test_permissions_requires_an_argument() {
        assert!(Cli::try_parse_from(["warden", "permissions"]).is_err());
    }

    // ── Commands ───────────────────────────────────────────────

    #[tokio::test]
    async fn test_run_with_missing_module_fails_without_blocking() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("warden.toml");
        std::fs::write(&config, "[storage]\nbackend = \"memory\"\n").unwrap();
        let module = dir.path().join("absent.wasm");

        let cli = Cli::try_parse_from([
            "warden",
            "--config",
            config.to_str().unwrap(),
            "run",
            module.to_str().unwrap(),
            "--id",
            "notes",
            "-p",
            "storage.*",
        ])
        .unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), cli.run())
            .await
            .expect("run must not wait on a config watcher or signal");
        assert!(result.is_err());
    }

    #[test]
    fn test_describe_permissions() {
        let lines = describe_permissions(&[
            "filesystem.read:/notes".to_string(),
            "network.request".to_string(),
        ])
        .unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("category=filesystem"));
        assert!(lines[0].contains("scope=/notes"));
        assert!(lines[1].contains("action=request"));
        assert!(lines[1].contains("scope=*"));
    }

    #[test]
    fn test_describe_permissions_fails_on_malformed() {
        let err = describe_permissions(&["storage.read".to_string(), "nodot".to_string()])
            .unwrap_err();
        assert!(matches!(err, WardenError::InvalidPermission { .. }));
    }

    #[test]
    fn test_render_config() {
        let config = WardenConfig::default();
        let text = render_config(&config, false).unwrap();
        assert!(text.contains("[sandbox]"));
        let json: serde_json::Value =
            serde_json::from_str(&render_config(&config, true).unwrap()).unwrap();
        assert_eq!(json["events"]["delivery"], "concurrent");
    }

    // ── Services ───────────────────────────────────────────────

    #[test]
    fn test_limits_and_bus_follow_config() {
        let mut config = WardenConfig::default();
        config.sandbox.call_timeout_ms = 1_500;
        config.events.delivery = "serialized".into();
        config.events.latency_warn_ms = 5;

        let limits = services::sandbox_limits(&config);
        assert_eq!(limits.call_timeout, Duration::from_millis(1_500));
        assert_eq!(limits.shutdown_deadline, Duration::from_secs(2));

        let bus = services::bus_config(&config).unwrap();
        assert_eq!(bus.delivery, DeliveryPolicy::Serialized);
        assert_eq!(bus.latency_warn, Duration::from_millis(5));

        let net = services::network_settings(&config);
        assert_eq!(net.burst, 60);
        assert_eq!(net.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_unknown_delivery_is_config_error() {
        let mut config = WardenConfig::default();
        config.events.delivery = "broadcast".into();
        assert!(matches!(
            services::bus_config(&config),
            Err(WardenError::Config(_))
        ));
    }

    #[test]
    fn test_sqlite_services_open_database() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.storage.backend = "sqlite".into();
        config.storage.db_path = dir.path().join("storage.db");
        assert!(services::build_services(&config).is_ok());
        assert!(dir.path().join("storage.db").exists());
    }

    #[tokio::test]
    async fn test_sandbox_over_configured_services() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let host = services::build_services(&config).unwrap();

        let sandbox = PluginSandbox::new(
            "notes",
            PluginSource::Native(Arc::new(Idle)),
            vec!["filesystem.*:/notes".into(), "storage.*".into()],
            host.clone(),
            services::sandbox_limits(&config),
        )
        .unwrap();
        sandbox.activate().unwrap();
        let ctx = sandbox.context_id().unwrap();
        let send = |id: &str, call: PluginCall| {
            Envelope::call(ctx, CallMessage::request("notes", id, call))
        };

        let write = sandbox
            .handle_api_call(send(
                "w",
                PluginCall::FsWriteFile {
                    path: "/notes/today.md".into(),
                    contents: "# hi".into(),
                },
            ))
            .await
            .unwrap();
        assert_eq!(write.body, HostSignal::Response(serde_json::Value::Null));
        assert!(dir.path().join("plugins/notes/notes/today.md").exists());

        let outside = sandbox
            .handle_api_call(send(
                "w2",
                PluginCall::FsWriteFile {
                    path: "/elsewhere.md".into(),
                    contents: "x".into(),
                },
            ))
            .await
            .unwrap();
        assert!(matches!(outside.body, HostSignal::Error(_)));

        sandbox
            .handle_api_call(send(
                "s",
                PluginCall::StorageSet {
                    key: "k".into(),
                    value: "v".into(),
                },
            ))
            .await
            .unwrap();
        let got = sandbox
            .handle_api_call(send("g", PluginCall::StorageGet { key: "k".into() }))
            .await
            .unwrap();
        assert_eq!(got.body, HostSignal::Response(json!("v")));

        sandbox.deactivate().await;
        assert!(host.permissions.get("notes").is_none());
    }
}
