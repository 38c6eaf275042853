#[cfg(test)]
mod tests {
    use warden_core::*;

    // ── Permission parsing ─────────────────────────────────────

    #[test]
    fn test_parse_scoped_permission() {
        let p = Permission::parse("filesystem.write:/notes").unwrap();
        assert_eq!(p.category, PermissionCategory::Filesystem);
        assert_eq!(p.action, "write");
        assert_eq!(p.scope.as_deref(), Some("/notes"));
        assert_eq!(p.to_string(), "filesystem.write:/notes");
    }

    #[test]
    fn test_parse_unscoped_permission() {
        let p: Permission = "storage.read".parse().unwrap();
        assert_eq!(p.category, PermissionCategory::Storage);
        assert!(p.scope.is_none());
    }

    #[test]
    fn test_parse_unknown_category_kept() {
        let p = Permission::parse("clipboard.read").unwrap();
        assert_eq!(p.category, PermissionCategory::Other("clipboard".into()));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["", "filesystem", ".write", "filesystem.", "network.request:", "a b.c"] {
            assert!(Permission::parse(bad).is_err(), "expected '{bad}' to fail");
        }
    }

    // ── Scope matching ─────────────────────────────────────────

    #[test]
    fn test_filesystem_scope_is_segment_prefix() {
        let p = Permission::parse("filesystem.write:/notes").unwrap();
        let fs = PermissionCategory::Filesystem;
        assert!(p.allows(&fs, "write", Some("/notes")));
        assert!(p.allows(&fs, "write", Some("/notes/x.txt")));
        assert!(p.allows(&fs, "write", Some("notes/deep/y.md")));
        assert!(!p.allows(&fs, "write", Some("/notes2/x.txt")));
        assert!(!p.allows(&fs, "read", Some("/notes/x.txt")));
        assert!(!p.allows(&fs, "write", None));
    }

    #[test]
    fn test_network_wildcard_scope() {
        let any = Permission::parse("network.request:*").unwrap();
        let net = PermissionCategory::Network;
        assert!(any.allows(&net, "request", Some("https://anything.org/x")));

        let sub = Permission::parse("network.request:*.example.com").unwrap();
        assert!(sub.allows(&net, "request", Some("https://api.example.com/v1")));
        assert!(sub.allows(&net, "request", Some("example.com")));
        assert!(!sub.allows(&net, "request", Some("https://example.org")));
        assert!(!sub.allows(&net, "request", Some("https://badexample.com")));
    }

    #[test]
    fn test_wildcard_action() {
        let p = Permission::parse("storage.*").unwrap();
        assert!(p.allows(&PermissionCategory::Storage, "write", None));
        assert!(!p.allows(&PermissionCategory::Filesystem, "write", None));
    }

    // ── Registry ───────────────────────────────────────────────

    #[test]
    fn test_registry_grant_check_revoke() {
        let registry = PermissionRegistry::new();
        registry.grant(
            "notes",
            PermissionSet::parse_all(&["filesystem.read:/notes", "storage.*"]).unwrap(),
        );

        assert!(
            registry
                .check("notes", PermissionCategory::Filesystem, "read", Some("/notes/a"))
                .is_ok()
        );
        let err = registry
            .check("notes", PermissionCategory::Filesystem, "write", Some("/notes/a"))
            .unwrap_err();
        assert!(matches!(err, WardenError::PermissionDenied { .. }));

        // Other plugins hold nothing.
        assert!(!registry.allows("other", &PermissionCategory::Storage, "read", None));

        assert!(registry.revoke("notes"));
        assert!(!registry.allows("notes", &PermissionCategory::Storage, "read", None));
    }

    #[test]
    fn test_parse_lenient_skips_bad_entries() {
        let set = PermissionSet::parse_lenient(&["storage.read", "garbage", "network.request:*"]);
        assert_eq!(set.len(), 2);
    }

    // ── Lifecycle ──────────────────────────────────────────────

    #[test]
    fn test_lifecycle_happy_path() {
        use PluginLifecycle::*;
        let mut state = Uninstalled;
        for next in [Installed, Loaded, Activated, Running, Deactivated, Activated] {
            state = state.transition("p", next).unwrap();
        }
        assert_eq!(state, Activated);
        assert!(state.is_active());
    }

    #[test]
    fn test_lifecycle_error_is_terminal() {
        use PluginLifecycle::*;
        for from in [Uninstalled, Installed, Loaded, Activated, Running, Deactivated] {
            assert!(from.can_transition_to(Error));
        }
        assert!(!Error.can_transition_to(Loaded));
        assert!(Error.is_terminal());
    }

    #[test]
    fn test_lifecycle_rejects_skips() {
        let err = PluginLifecycle::Installed
            .transition("p", PluginLifecycle::Running)
            .unwrap_err();
        assert!(err.to_string().contains("installed -> running"));
    }

    // ── Protocol ───────────────────────────────────────────────

    #[test]
    fn test_host_error_roundtrip() {
        let msg = HostMessage::error("p", "r1", ApiError::timeout("fs.readFile", 50));
        let json = serde_json::to_string(&msg).unwrap();
        let restored: HostMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, msg);
        match restored.body {
            HostSignal::Error(e) => assert_eq!(e.code, ApiErrorCode::Timeout),
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn test_http_request_defaults() {
        let msg: CallMessage = serde_json::from_str(
            r#"{"requestId":"r","pluginId":"p","type":"http.request","payload":{"url":"https://x.dev"}}"#,
        )
        .unwrap();
        match msg.body {
            PluginCall::HttpRequest(req) => {
                assert_eq!(req.method, HttpMethod::Get);
                assert!(req.headers.is_empty());
                assert!(req.body.is_none());
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn test_error_display() {
        let err = WardenError::NotFound("x.txt".into());
        assert!(err.to_string().contains("x.txt"));
    }
}
