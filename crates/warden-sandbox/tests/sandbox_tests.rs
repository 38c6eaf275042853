#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::future::Future;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use warden_capability::mock::MockBackend;
    use warden_core::{
        ApiErrorCode, CallMessage, HostMessage, HostSignal, PluginCall, PluginLifecycle,
    };
    use warden_events::handler;
    use warden_sandbox::*;

    // ── Helpers ────────────────────────────────────────────────

    struct ScriptFn<F>(F);

    #[async_trait]
    impl<F, Fut> PluginScript for ScriptFn<F>
    where
        F: Fn(PluginApi) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        async fn activate(&self, api: PluginApi) -> anyhow::Result<()> {
            (self.0)(api).await
        }
    }

    fn script<F, Fut>(f: F) -> PluginSource
    where
        F: Fn(PluginApi) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        PluginSource::Native(Arc::new(ScriptFn(f)))
    }

    fn idle() -> PluginSource {
        script(|_api| async { Ok(()) })
    }

    fn build(
        source: PluginSource,
        mock: Arc<MockBackend>,
        limits: SandboxLimits,
    ) -> (PluginSandbox, HostServices) {
        let services = HostServices::mock(mock);
        let sandbox = PluginSandbox::new(
            "notes",
            source,
            vec!["filesystem.read:/notes".into(), "storage.*".into()],
            services.clone(),
            limits,
        )
        .unwrap();
        (sandbox, services)
    }

    fn active(mock: Arc<MockBackend>) -> (PluginSandbox, HostServices) {
        let (sandbox, services) = build(idle(), mock, SandboxLimits::default());
        sandbox.activate().unwrap();
        (sandbox, services)
    }

    fn call(sandbox: &PluginSandbox, request_id: &str, call: PluginCall) -> Envelope {
        Envelope::call(
            sandbox.context_id().unwrap(),
            CallMessage::request("notes", request_id, call),
        )
    }

    fn read(path: &str) -> PluginCall {
        PluginCall::FsReadFile { path: path.into() }
    }

    fn error_code(message: &HostMessage) -> ApiErrorCode {
        match &message.body {
            HostSignal::Error(e) => e.code,
            other => panic!("expected api.error, got {:?}", other),
        }
    }

    async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for plugin")
            .expect("plugin channel closed")
    }

    // ── Routing ────────────────────────────────────────────────

    #[tokio::test]
    async fn test_read_file_answered_with_same_request_id() {
        let mock = Arc::new(MockBackend::new().with_file("/notes/x.txt", "hello"));
        let (sandbox, _) = active(mock.clone());

        let reply = sandbox
            .handle_api_call(call(&sandbox, "req-1", read("/notes/x.txt")))
            .await
            .unwrap();
        assert_eq!(reply.request_id, "req-1");
        assert_eq!(reply.plugin_id, "notes");
        assert_eq!(reply.body, HostSignal::Response(json!("hello")));
        assert_eq!(mock.calls(), vec!["notes fs.readFile /notes/x.txt"]);
    }

    #[tokio::test]
    async fn test_mismatched_plugin_id_never_reaches_backend() {
        let mock = Arc::new(MockBackend::new().with_file("/x", "secret"));
        let (sandbox, _) = active(mock.clone());

        let forged = Envelope::call(
            sandbox.context_id().unwrap(),
            CallMessage::request("other-plugin", "req-1", read("/x")),
        );
        assert!(sandbox.handle_api_call(forged).await.is_none());
        assert_eq!(mock.call_count(), 0);
        assert_eq!(sandbox.stats().rejected, 1);
        assert_eq!(sandbox.stats().dispatched, 0);
    }

    #[tokio::test]
    async fn test_foreign_origin_is_rejected() {
        let mock = Arc::new(MockBackend::new().with_file("/x", "secret"));
        let (sandbox, _) = active(mock.clone());

        let forged = Envelope::call(
            ContextId::fresh(),
            CallMessage::request("notes", "req-1", read("/x")),
        );
        assert!(sandbox.handle_api_call(forged).await.is_none());
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn test_calls_before_activation_are_rejected() {
        let mock = Arc::new(MockBackend::new());
        let (sandbox, _) = build(idle(), mock.clone(), SandboxLimits::default());
        assert_eq!(sandbox.lifecycle(), PluginLifecycle::Loaded);
        assert!(sandbox.context_id().is_none());

        let env = Envelope::call(
            ContextId::fresh(),
            CallMessage::request("notes", "req-1", read("/x")),
        );
        assert!(sandbox.handle_api_call(env).await.is_none());
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_request_id_is_dropped() {
        let mock = Arc::new(MockBackend::new());
        let (sandbox, _) = active(mock.clone());
        assert!(
            sandbox
                .handle_api_call(call(&sandbox, "", PluginCall::StorageKeys))
                .await
                .is_none()
        );
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_in_flight_request_id_is_dropped() {
        let mock = Arc::new(
            MockBackend::new()
                .with_file("/x", "data")
                .with_delay(Duration::from_millis(100)),
        );
        let (sandbox, _) = active(mock.clone());

        let first = {
            let sandbox = sandbox.clone();
            let env = call(&sandbox, "dup", read("/x"));
            tokio::spawn(async move { sandbox.handle_api_call(env).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(
            sandbox
                .handle_api_call(call(&sandbox, "dup", read("/x")))
                .await
                .is_none()
        );

        let reply = first.await.unwrap().unwrap();
        assert_eq!(reply.body, HostSignal::Response(json!("data")));
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_malformed_message_gets_protocol_error() {
        let (sandbox, _) = active(Arc::new(MockBackend::new()));
        let origin = sandbox.context_id().unwrap();

        let env = Envelope::decode(
            origin,
            br#"{"type":"fs.format","requestId":"r9","pluginId":"notes","payload":{}}"#,
        );
        let reply = sandbox.handle_api_call(env).await.unwrap();
        assert_eq!(reply.request_id, "r9");
        assert_eq!(error_code(&reply), ApiErrorCode::Protocol);

        // Host-only types cannot be sent by a plugin either.
        let env = Envelope::decode(
            origin,
            br#"{"type":"api.response","requestId":"r10","pluginId":"notes","payload":1}"#,
        );
        let reply = sandbox.handle_api_call(env).await.unwrap();
        assert_eq!(error_code(&reply), ApiErrorCode::Protocol);

        // Nothing to correlate with: dropped.
        assert!(
            sandbox
                .handle_api_call(Envelope::decode(origin, b"garbage"))
                .await
                .is_none()
        );
    }

    // ── Failures ───────────────────────────────────────────────

    #[tokio::test]
    async fn test_backend_failure_becomes_error_response() {
        let (sandbox, _) = active(Arc::new(MockBackend::new()));
        let reply = sandbox
            .handle_api_call(call(&sandbox, "req-1", read("/missing.txt")))
            .await
            .unwrap();
        assert_eq!(reply.request_id, "req-1");
        assert_eq!(error_code(&reply), ApiErrorCode::NotFound);
        assert_eq!(sandbox.stats().errors, 1);
    }

    #[tokio::test]
    async fn test_panicking_backend_is_contained() {
        let mock = Arc::new(MockBackend::new().panicking_on("fs.exists"));
        let (sandbox, _) = active(mock);
        let reply = sandbox
            .handle_api_call(call(
                &sandbox,
                "req-1",
                PluginCall::FsExists { path: "/x".into() },
            ))
            .await
            .unwrap();
        assert_eq!(error_code(&reply), ApiErrorCode::Internal);

        // The sandbox keeps serving.
        let reply = sandbox
            .handle_api_call(call(&sandbox, "req-2", PluginCall::StorageSize))
            .await
            .unwrap();
        assert_eq!(reply.body, HostSignal::Response(json!(0)));
    }

    #[tokio::test]
    async fn test_slow_call_times_out() {
        let mock = Arc::new(
            MockBackend::new()
                .with_file("/x", "late")
                .with_delay(Duration::from_millis(500)),
        );
        let limits = SandboxLimits {
            call_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let (sandbox, _) = build(idle(), mock, limits);
        sandbox.activate().unwrap();

        let reply = sandbox
            .handle_api_call(call(&sandbox, "slow", read("/x")))
            .await
            .unwrap();
        assert_eq!(reply.request_id, "slow");
        assert_eq!(error_code(&reply), ApiErrorCode::Timeout);
        assert_eq!(sandbox.in_flight(), 0);
    }

    // ── Lifecycle ──────────────────────────────────────────────

    #[tokio::test]
    async fn test_deactivate_cancels_in_flight_calls() {
        let mock = Arc::new(
            MockBackend::new()
                .with_file("/x", "never")
                .with_delay(Duration::from_secs(10)),
        );
        let limits = SandboxLimits {
            shutdown_deadline: Duration::from_millis(100),
            ..Default::default()
        };
        let (sandbox, _) = build(idle(), mock, limits);
        sandbox.activate().unwrap();

        let pending = {
            let sandbox = sandbox.clone();
            let env = call(&sandbox, "req-1", read("/x"));
            tokio::spawn(async move { sandbox.handle_api_call(env).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sandbox.in_flight(), 1);

        sandbox.deactivate().await;
        // Deactivation answered it; the router must not answer again.
        assert!(pending.await.unwrap().is_none());
        assert_eq!(sandbox.in_flight(), 0);
        assert_eq!(sandbox.stats().cancelled, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_calls_racing_deactivation_never_reach_backend() {
        let mock = Arc::new(MockBackend::new().with_file("/notes/x.txt", "hello"));
        let (sandbox, _) = active(mock.clone());

        let racing: Vec<_> = (0..64)
            .map(|i| {
                let sandbox = sandbox.clone();
                let env = call(&sandbox, &format!("race-{i}"), read("/notes/x.txt"));
                tokio::spawn(async move { sandbox.handle_api_call(env).await })
            })
            .collect();
        sandbox.deactivate().await;
        let settled = mock.call_count();

        for handle in racing {
            if let Some(reply) = handle.await.unwrap() {
                match &reply.body {
                    HostSignal::Response(value) => assert_eq!(value, &json!("hello")),
                    _ => assert_eq!(error_code(&reply), ApiErrorCode::Cancelled),
                }
            }
        }
        // Nothing accepted during or after deactivation touched the backend.
        assert_eq!(mock.call_count(), settled);
        assert_eq!(sandbox.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_deactivate_releases_network_state() {
        let mock = Arc::new(MockBackend::new());
        let (sandbox, _) = active(mock.clone());
        assert!(mock.released().is_empty());

        sandbox.deactivate().await;
        assert_eq!(mock.released(), vec!["notes"]);

        // Already inactive: nothing further to release.
        sandbox.deactivate().await;
        assert_eq!(mock.released(), vec!["notes"]);
    }

    #[tokio::test]
    async fn test_lifecycle_and_idempotent_deactivate() {
        let (sandbox, services) = build(
            idle(),
            Arc::new(MockBackend::new()),
            SandboxLimits::default(),
        );
        assert!(services.permissions.get("notes").is_some());
        assert_eq!(sandbox.permissions().len(), 2);

        sandbox.activate().unwrap();
        assert_eq!(sandbox.lifecycle(), PluginLifecycle::Running);
        let first_context = sandbox.context_id().unwrap();
        // Activating an active sandbox changes nothing.
        sandbox.activate().unwrap();
        assert_eq!(sandbox.context_id(), Some(first_context));

        sandbox.deactivate().await;
        assert_eq!(sandbox.lifecycle(), PluginLifecycle::Deactivated);
        assert!(sandbox.context_id().is_none());
        assert!(services.permissions.get("notes").is_none());

        sandbox.deactivate().await;
        assert_eq!(sandbox.lifecycle(), PluginLifecycle::Deactivated);

        // Re-activation mounts a fresh context.
        sandbox.activate().unwrap();
        assert_eq!(sandbox.lifecycle(), PluginLifecycle::Running);
        assert_ne!(sandbox.context_id(), Some(first_context));
        assert!(services.permissions.get("notes").is_some());
        sandbox.deactivate().await;
    }

    #[tokio::test]
    async fn test_deactivate_before_activate_is_noop() {
        let (sandbox, _) = build(
            idle(),
            Arc::new(MockBackend::new()),
            SandboxLimits::default(),
        );
        sandbox.deactivate().await;
        assert_eq!(sandbox.lifecycle(), PluginLifecycle::Loaded);
    }

    #[tokio::test]
    async fn test_stale_context_rejected_after_reactivation() {
        let mock = Arc::new(MockBackend::new().with_file("/x", "data"));
        let (sandbox, _) = active(mock.clone());
        let old = sandbox.context_id().unwrap();
        sandbox.deactivate().await;
        sandbox.activate().unwrap();

        let env = Envelope::call(old, CallMessage::request("notes", "req-1", read("/x")));
        assert!(sandbox.handle_api_call(env).await.is_none());
        assert_eq!(mock.call_count(), 1); // the unwatch issued by deactivate
    }

    #[tokio::test]
    async fn test_empty_plugin_id_fails_construction() {
        let result = PluginSandbox::new(
            "",
            idle(),
            vec![],
            HostServices::mock(Arc::new(MockBackend::new())),
            SandboxLimits::default(),
        );
        assert!(result.is_err());
    }

    // ── Events ─────────────────────────────────────────────────

    #[tokio::test]
    async fn test_event_subscription_bookkeeping() {
        let (sandbox, services) = active(Arc::new(MockBackend::new()));
        let on = |id: &str| call(&sandbox, id, PluginCall::EventOn { event: "saved".into() });

        let reply = sandbox.handle_api_call(on("a")).await.unwrap();
        assert_eq!(
            reply.body,
            HostSignal::Response(json!({"subscriptionId": "a", "event": "notes:saved"}))
        );
        sandbox.handle_api_call(on("b")).await.unwrap();

        // Two registrations share one bus subscription.
        assert_eq!(sandbox.subscribed_events(), vec!["saved"]);
        assert_eq!(services.bus.subscriber_count("notes:saved"), 1);

        let off = |id: &str, sub: &str| {
            call(
                &sandbox,
                id,
                PluginCall::EventOff {
                    event: "saved".into(),
                    subscription_id: Some(sub.into()),
                },
            )
        };
        let reply = sandbox.handle_api_call(off("c", "a")).await.unwrap();
        assert_eq!(
            reply.body,
            HostSignal::Response(json!({"removed": true, "released": false}))
        );
        assert_eq!(services.bus.subscriber_count("notes:saved"), 1);

        let reply = sandbox.handle_api_call(off("d", "b")).await.unwrap();
        assert_eq!(
            reply.body,
            HostSignal::Response(json!({"removed": true, "released": true}))
        );
        assert_eq!(services.bus.subscriber_count("notes:saved"), 0);
        assert!(sandbox.subscribed_events().is_empty());

        let reply = sandbox.handle_api_call(off("e", "b")).await.unwrap();
        assert_eq!(
            reply.body,
            HostSignal::Response(json!({"removed": false, "released": false}))
        );
    }

    #[tokio::test]
    async fn test_plugin_emit_is_namespaced() {
        let (sandbox, services) = active(Arc::new(MockBackend::new()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        services.bus.on(
            "notes:saved",
            handler(move |data| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(data);
                    Ok(())
                }
            }),
            None,
        );

        let reply = sandbox
            .handle_api_call(call(
                &sandbox,
                "req-1",
                PluginCall::EventEmit {
                    event: "saved".into(),
                    data: json!({"id": 7}),
                },
            ))
            .await
            .unwrap();
        assert_eq!(
            reply.body,
            HostSignal::Response(json!({"event": "notes:saved", "delivered": 1}))
        );
        assert_eq!(next(&mut rx).await, json!({"id": 7}));
    }

    #[tokio::test]
    async fn test_deactivate_releases_bus_subscriptions() {
        let (sandbox, services) = active(Arc::new(MockBackend::new()));
        sandbox
            .handle_api_call(call(&sandbox, "a", PluginCall::EventOn { event: "saved".into() }))
            .await
            .unwrap();
        sandbox
            .handle_api_call(call(
                &sandbox,
                "b",
                PluginCall::EventOn {
                    event: "host:theme".into(),
                },
            ))
            .await
            .unwrap();
        assert_eq!(sandbox.stats().subscriptions, 2);

        sandbox.deactivate().await;
        assert_eq!(services.bus.subscriber_count("notes:saved"), 0);
        assert_eq!(services.bus.subscriber_count("host:theme"), 0);
        assert_eq!(sandbox.stats().subscriptions, 0);
    }

    // ── Guest API end to end ───────────────────────────────────

    #[tokio::test]
    async fn test_guest_reads_file_through_sandbox() {
        let mock = Arc::new(MockBackend::new().with_file("/notes/x.txt", "hello"));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let source = script(move |api: PluginApi| {
            let tx = tx.clone();
            async move {
                let text = api.fs().read_file("/notes/x.txt").await?;
                let missing = api.fs().read_file("/nope").await;
                let _ = tx.send((text, missing.err().map(|e| e.code)));
                Ok(())
            }
        });
        let (sandbox, _) = build(source, mock, SandboxLimits::default());
        sandbox.activate().unwrap();

        let (text, missing) = next(&mut rx).await;
        assert_eq!(text, "hello");
        assert_eq!(missing, Some(ApiErrorCode::NotFound));
        assert_eq!(sandbox.stats().dispatched, 2);
        sandbox.deactivate().await;
    }

    #[tokio::test]
    async fn test_guest_storage_round_trip() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let source = script(move |api: PluginApi| {
            let tx = tx.clone();
            async move {
                let storage = api.storage();
                storage.set_json("k", &json!({"a": 1})).await?;
                let back: Option<Value> = storage.get_json("k").await?;
                let missing = storage.get("missing-key").await?;
                let deleted = storage.delete("missing-key").await?;
                let size = storage.size().await?;
                let _ = tx.send(json!({
                    "back": back,
                    "missing": missing,
                    "deleted": deleted,
                    "size": size,
                }));
                Ok(())
            }
        });
        let (sandbox, _) = build(source, Arc::new(MockBackend::new()), SandboxLimits::default());
        sandbox.activate().unwrap();

        assert_eq!(
            next(&mut rx).await,
            json!({"back": {"a": 1}, "missing": null, "deleted": false, "size": 1})
        );
        sandbox.deactivate().await;
    }

    #[tokio::test]
    async fn test_guest_receives_subscribed_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let source = script(move |api: PluginApi| {
            let tx = tx.clone();
            async move {
                let forward = tx.clone();
                api.events()
                    .on(
                        "saved",
                        handler(move |data| {
                            let forward = forward.clone();
                            async move {
                                let _ = forward.send(data);
                                Ok(())
                            }
                        }),
                    )
                    .await?;
                let _ = tx.send(json!("ready"));
                Ok(())
            }
        });
        let (sandbox, services) = build(source, Arc::new(MockBackend::new()), SandboxLimits::default());
        sandbox.activate().unwrap();
        assert_eq!(next(&mut rx).await, json!("ready"));

        let report = services.bus.emit("notes:saved", json!({"n": 1})).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(next(&mut rx).await, json!({"n": 1}));

        // Another plugin's short name does not reach this one.
        assert_eq!(services.bus.emit("saved", json!({"n": 2})).await.delivered, 0);
        sandbox.deactivate().await;
    }

    #[tokio::test]
    async fn test_guest_request_times_out() {
        let mock = Arc::new(
            MockBackend::new()
                .with_file("/x", "late")
                .with_delay(Duration::from_millis(500)),
        );
        let limits = SandboxLimits {
            request_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let source = script(move |api: PluginApi| {
            let tx = tx.clone();
            async move {
                let result = api.fs().read_file("/x").await;
                let _ = tx.send((result.err().map(|e| e.code), api.pending_count()));
                Ok(())
            }
        });
        let (sandbox, _) = build(source, mock, limits);
        sandbox.activate().unwrap();

        let (code, pending) = next(&mut rx).await;
        assert_eq!(code, Some(ApiErrorCode::Timeout));
        assert_eq!(pending, 0);
        sandbox.deactivate().await;
    }

    // ── WASM contexts ──────────────────────────────────────────

    #[cfg(feature = "wasm")]
    mod wasm_context {
        use super::*;

        const KEYS: &str = r#"{"type":"storage.keys","requestId":"w1","pluginId":"wp"}"#;
        const FORGED: &str = r#"{"type":"storage.keys","requestId":"w2","pluginId":"intruder"}"#;
        const SUBSCRIBE: &str =
            r#"{"type":"event.on","payload":{"event":"tick"},"requestId":"w3","pluginId":"wp"}"#;
        const AFTER_TRAP: &str = r#"{"type":"storage.has","payload":{"key":"after-trap"},"requestId":"w4","pluginId":"wp"}"#;

        /// A guest that sends its first three messages on activation, sends
        /// `AFTER_TRAP` for any message containing `go-g`, and traps on
        /// everything else (every response it receives).
        fn guest_module() -> Vec<u8> {
            let mut data = String::new();
            let mut spans = Vec::new();
            let mut offset = 0;
            for message in [KEYS, FORGED, SUBSCRIBE, AFTER_TRAP] {
                data.push_str(&format!(
                    "(data (i32.const {offset}) \"{}\")\n",
                    message.replace('"', "\\\"")
                ));
                spans.push((offset, message.len()));
                offset += message.len();
            }
            let send = |i: usize| {
                format!(
                    "(call $send (i32.const {}) (i32.const {}))",
                    spans[i].0, spans[i].1
                )
            };
            let (keys, forged, subscribe, after) = (send(0), send(1), send(2), send(3));
            format!(
                r#"(module
  (import "warden" "send" (func $send (param i32 i32)))
  (memory (export "memory") 1)
  (global $seen (mut i32) (i32.const 0))
  {data}
  (func (export "warden_malloc") (param $size i32) (result i32)
    (i32.const 4096))
  (func $has_marker (param $ptr i32) (param $len i32) (result i32)
    (local $i i32)
    (block $done
      (loop $scan
        (br_if $done (i32.gt_s (i32.add (local.get $i) (i32.const 4)) (local.get $len)))
        (if (i32.eq (i32.load (i32.add (local.get $ptr) (local.get $i))) (i32.const 0x672d6f67))
          (then (return (i32.const 1))))
        (local.set $i (i32.add (local.get $i) (i32.const 1)))
        (br $scan)))
    (i32.const 0))
  (func (export "warden_on_message") (param $ptr i32) (param $len i32)
    (if (i32.eqz (global.get $seen))
      (then
        (global.set $seen (i32.const 1))
        {keys}
        {forged}
        {subscribe}
        (return)))
    (if (call $has_marker (local.get $ptr) (local.get $len))
      (then
        {after}
        (return)))
    unreachable))"#
            )
            .into_bytes()
        }

        async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
            for _ in 0..500 {
                if check() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("timed out waiting for {what}");
        }

        fn wasm_sandbox(mock: Arc<MockBackend>) -> (PluginSandbox, HostServices) {
            let services = HostServices::mock(mock);
            let sandbox = PluginSandbox::new(
                "wp",
                PluginSource::Wasm {
                    bytes: guest_module(),
                    settings: WasmSettings::default(),
                },
                vec!["storage.*".into()],
                services.clone(),
                SandboxLimits::default(),
            )
            .unwrap();
            (sandbox, services)
        }

        #[tokio::test]
        async fn test_guest_send_reaches_backend_and_forgery_is_rejected() {
            let mock = Arc::new(MockBackend::new());
            let (sandbox, _) = wasm_sandbox(mock.clone());
            sandbox.activate().unwrap();

            eventually("storage.keys", || mock.calls().contains(&"wp storage.keys".to_string())).await;
            eventually("forged call rejection", || sandbox.stats().rejected == 1).await;
            eventually("subscription", || sandbox.subscribed_events() == vec!["tick"]).await;

            let stats = sandbox.stats();
            assert_eq!(stats.dispatched, 2);
            assert_eq!(stats.rejected, 1);
            // The forged call never reached the backend.
            assert_eq!(mock.calls(), vec!["wp storage.keys"]);
            sandbox.deactivate().await;
        }

        #[tokio::test]
        async fn test_guest_trap_is_confined_to_one_message() {
            let mock = Arc::new(MockBackend::new());
            let (sandbox, services) = wasm_sandbox(mock.clone());
            sandbox.activate().unwrap();

            eventually("subscription", || sandbox.subscribed_events() == vec!["tick"]).await;
            // Give the guest time to trap on the responses it received.
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert_eq!(sandbox.lifecycle(), PluginLifecycle::Running);

            let report = services.bus.emit("wp:tick", json!("go-go")).await;
            assert_eq!(report.delivered, 1);
            eventually("call after trap", || {
                mock.calls().contains(&"wp storage.has after-trap".to_string())
            })
            .await;
            assert_eq!(sandbox.lifecycle(), PluginLifecycle::Running);
            sandbox.deactivate().await;
            assert_eq!(sandbox.lifecycle(), PluginLifecycle::Deactivated);
        }
    }
}
