// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Traffic fan-out through the mix caller.

mod common;

use async_trait::async_trait;
use common::{collecting_sink, StaticLoader};
use parking_lot::Mutex;
use scanhook_engine::hooks::{async_hook_fn, hook_fn};
use scanhook_engine::loader::{NUCLEI_TEMPLATE_PARAM, PARAMS_BINDING};
use scanhook_engine::mixer::MatcherFactory;
use scanhook_engine::{
    ArgThunk, EngineConfig, FingerprintMatcher, HookCallback, HookValue, MatchError,
    MemoryScriptStore, MixPluginCaller, NativeUnit, PluginParams, Script, ScriptType,
    ServiceMatch, SharedHookFunction, WrapperKind,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

type Hits = Arc<Mutex<Vec<(String, Vec<HookValue>)>>>;

fn recorder(hits: Hits, label: &'static str) -> SharedHookFunction {
    hook_fn(move |_ctx, args| {
        hits.lock().push((label.to_string(), args));
        Ok(HookValue::Null)
    })
}

fn count(hits: &Hits, label: &str) -> usize {
    hits.lock().iter().filter(|(l, _)| l == label).count()
}

fn get(path: &str) -> Vec<u8> {
    format!("GET {} HTTP/1.1\r\nHost: example.com\r\n\r\n", path).into_bytes()
}

struct CountingMatcher;

#[async_trait]
impl FingerprintMatcher for CountingMatcher {
    async fn match_service(
        &self,
        host: &str,
        port: u16,
        _use_cache: bool,
    ) -> Result<ServiceMatch, MatchError> {
        let mut found = ServiceMatch::open(host, port);
        found.service = "http".to_string();
        Ok(found)
    }
}

#[tokio::test]
async fn test_dedup_by_site_path_and_params() {
    let mix = MixPluginCaller::builder().build().unwrap();
    let hits: Hits = Arc::default();
    let dispatcher = mix.dispatcher();
    dispatcher.add_native("p", "mirrorHTTPFlow", recorder(hits.clone(), "all"));
    dispatcher.add_native("p", "mirrorNewWebsite", recorder(hits.clone(), "site"));
    dispatcher.add_native("p", "mirrorNewWebsitePath", recorder(hits.clone(), "path"));
    dispatcher.add_native("p", "mirrorNewWebsitePathParams", recorder(hits.clone(), "params"));

    let flows = [
        ("http://example.com/a?id=1", get("/a?id=1")),
        ("http://example.com/a?id=2", get("/a?id=2")),
        ("http://example.com/a?name=x", get("/a?name=x")),
        ("http://example.com/b", get("/b")),
    ];
    for (url, request) in &flows {
        mix.mirror_http_flow(false, url, request, b"", b"", &[]).await;
    }

    assert_eq!(count(&hits, "all"), 4);
    assert_eq!(count(&hits, "site"), 1);
    assert_eq!(count(&hits, "path"), 2);
    assert_eq!(count(&hits, "params"), 3);

    // Another port is another site.
    mix.mirror_http_flow(false, "http://example.com:8080/a", &get("/a"), b"", b"", &[])
        .await;
    assert_eq!(count(&hits, "site"), 2);
}

#[tokio::test]
async fn test_mirror_hook_arguments() {
    let mix = MixPluginCaller::builder().build().unwrap();
    let hits: Hits = Arc::default();
    mix.dispatcher()
        .add_native("p", "mirrorHTTPFlow", recorder(hits.clone(), "all"));

    let request = get("/");
    mix.mirror_http_flow(true, "https://example.com/", &request, b"rsp", b"body", &[])
        .await;

    let (_, args) = hits.lock()[0].clone();
    assert_eq!(args[0], HookValue::Bool(true));
    assert_eq!(args[1], HookValue::Str("https://example.com/".into()));
    assert_eq!(args[2], HookValue::Bytes(request));
    assert_eq!(args[3], HookValue::Bytes(b"rsp".to_vec()));
    assert_eq!(args[4], HookValue::Bytes(b"body".to_vec()));
}

#[tokio::test]
async fn test_include_list_rejects_before_any_hook() {
    let mut config = EngineConfig::default();
    config.mix.includes = vec!["*.example.com".to_string()];
    let mix = MixPluginCaller::builder().with_config(config).build().unwrap();
    let hits: Hits = Arc::default();
    mix.dispatcher()
        .add_native("p", "mirrorHTTPFlow", recorder(hits.clone(), "all"));

    mix.mirror_http_flow(false, "http://other.org/", &get("/"), b"", b"", &[]).await;
    assert!(hits.lock().is_empty());
    mix.mirror_http_flow(false, "http://www.example.com/", &get("/"), b"", b"", &[])
        .await;
    assert_eq!(hits.lock().len(), 1);
}

#[tokio::test]
async fn test_new_site_scans_run_in_background_with_one_matcher() {
    let built = Arc::new(AtomicUsize::new(0));
    let counter = built.clone();
    let factory: MatcherFactory = Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(CountingMatcher) as Arc<dyn FingerprintMatcher>)
    });
    let mix = MixPluginCaller::builder()
        .with_matcher_factory(factory)
        .build()
        .unwrap();
    let hits: Hits = Arc::default();
    let dispatcher = mix.dispatcher();
    dispatcher.add_native("scan", "handle", recorder(hits.clone(), "handle"));
    dispatcher.add_native("scan", "execNuclei", recorder(hits.clone(), "nuclei"));
    dispatcher.add_native("scan", "execNasl", recorder(hits.clone(), "nasl"));

    mix.mirror_http_flow(false, "http://a.example.com/", &get("/"), b"", b"", &[]).await;
    mix.mirror_http_flow(false, "http://b.example.com/", &get("/"), b"", b"", &[]).await;
    mix.mirror_http_flow(false, "http://b.example.com/x", &get("/x"), b"", b"", &[]).await;
    mix.wait().await;

    assert_eq!(built.load(Ordering::SeqCst), 1);
    assert_eq!(count(&hits, "handle"), 2);
    assert_eq!(count(&hits, "nuclei"), 2);
    assert_eq!(count(&hits, "nasl"), 2);

    let handled: Vec<_> = hits
        .lock()
        .iter()
        .filter(|(l, _)| l == "handle")
        .map(|(_, args)| args[0].clone())
        .collect();
    for value in handled {
        match value {
            HookValue::Json(json) => {
                assert_eq!(json["port"], 80);
                assert_eq!(json["service"], "http");
            }
            other => panic!("unexpected handle argument {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_scan_port_disabled_skips_fingerprint() {
    let built = Arc::new(AtomicUsize::new(0));
    let counter = built.clone();
    let factory: MatcherFactory = Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(CountingMatcher) as Arc<dyn FingerprintMatcher>)
    });
    let mix = MixPluginCaller::builder()
        .with_matcher_factory(factory)
        .build()
        .unwrap();
    let hits: Hits = Arc::default();
    mix.dispatcher()
        .add_native("scan", "handle", recorder(hits.clone(), "handle"));

    mix.mirror_http_flow_ex(false, false, "http://a.example.com/", &get("/"), b"", b"", &[])
        .await;
    mix.wait().await;

    assert_eq!(built.load(Ordering::SeqCst), 0);
    assert!(hits.lock().is_empty());
}

#[tokio::test]
async fn test_service_scan_result_fans_out_to_three_hooks() {
    let mix = MixPluginCaller::builder().build().unwrap();
    let hits: Hits = Arc::default();
    let dispatcher = mix.dispatcher();
    dispatcher.add_native("scan", "handle", recorder(hits.clone(), "handle"));
    dispatcher.add_native("scan", "execNuclei", recorder(hits.clone(), "nuclei"));
    dispatcher.add_native("scan", "execNasl", recorder(hits.clone(), "nasl"));

    mix.handle_service_scan_result(&ServiceMatch::open("10.0.0.1", 22))
        .await;

    let hits = hits.lock().clone();
    assert_eq!(hits.len(), 3);
    for (label, args) in hits {
        match label.as_str() {
            "handle" => assert!(matches!(args[0], HookValue::Json(_))),
            _ => assert_eq!(args[0], HookValue::Str("10.0.0.1:22".into())),
        }
    }
}

#[tokio::test]
async fn test_hijack_runs_inline_with_lazy_arguments() {
    let mix = MixPluginCaller::builder().build().unwrap();
    mix.set_concurrent(2).unwrap();

    let evaluated = Arc::new(AtomicUsize::new(0));
    let thunk = {
        let evaluated = evaluated.clone();
        ArgThunk::new(move || {
            evaluated.fetch_add(1, Ordering::SeqCst);
            HookValue::Bytes(b"GET / HTTP/1.1\r\n\r\n".to_vec())
        })
    };
    let forwarded = Arc::new(Mutex::new(None));
    let forward = {
        let forwarded = forwarded.clone();
        HookCallback::new("forward", move |args| {
            *forwarded.lock() = args.into_iter().next();
            HookValue::Null
        })
    };
    let drop = HookCallback::new("drop", |_| HookValue::Null);

    // No caller: nothing is evaluated.
    mix.call_hijack_request(false, "http://a/", thunk.clone(), forward.clone(), drop.clone())
        .await;
    assert_eq!(evaluated.load(Ordering::SeqCst), 0);

    mix.dispatcher().add_native(
        "rewriter",
        "hijackHTTPRequest",
        hook_fn(|_ctx, args| {
            let forward = args[3]
                .as_callback()
                .ok_or_else(|| scanhook_engine::HookError::InvalidArgument("forward".into()))?;
            forward.call(vec![HookValue::Str("modified".into())]);
            Ok(HookValue::Null)
        }),
    );

    mix.call_hijack_request(false, "http://a/", thunk, forward, drop).await;
    // Visible without wait() even though a limiter is configured.
    assert_eq!(evaluated.load(Ordering::SeqCst), 1);
    assert_eq!(*forwarded.lock(), Some(HookValue::Str("modified".into())));
}

#[tokio::test]
async fn test_load_plugin_by_name_routes_by_script_type() {
    let hits: Hits = Arc::default();
    let unit = NativeUnit::new()
        .with_symbol("mirrorHTTPFlow", recorder(hits.clone(), "mirror"))
        .with_symbol("handle", recorder(hits.clone(), "handle"))
        .with_symbol("execNuclei", recorder(hits.clone(), "nuclei"));
    let loader = Arc::new(
        StaticLoader::new()
            .with_unit("mitm-src", unit.clone())
            .with_unit("scan-src", unit.clone())
            .with_unit("nuclei-wrapper", unit)
            .with_wrapper(WrapperKind::Nuclei, "nuclei-wrapper"),
    );
    let store = Arc::new(MemoryScriptStore::new());
    store.insert(Script::new("mitm-plugin", ScriptType::Mitm, "mitm-src"));
    store.insert(Script::new("scan-plugin", ScriptType::PortScan, "scan-src"));
    store.insert(Script::new("[cve-2024-0001]", ScriptType::Nuclei, "id: cve-2024-0001"));

    let mix = MixPluginCaller::builder()
        .with_loader(loader.clone())
        .with_store(store)
        .build()
        .unwrap();
    let ctx = mix.context();
    let params = PluginParams::new();

    mix.load_plugin_by_name(&ctx, "mitm-plugin", &params, None).await.unwrap();
    mix.load_plugin_by_name(&ctx, "scan-plugin", &params, None).await.unwrap();
    mix.load_plugin_by_name(&ctx, "[cve-2024-0001]", &params, None).await.unwrap();

    let hooks = mix.dispatcher().current_hooks();
    let owners = |hook: &str| -> Vec<String> {
        hooks
            .iter()
            .find(|(name, _)| name == hook)
            .map(|(_, callers)| callers.iter().map(|c| c.plugin_id.clone()).collect())
            .unwrap_or_default()
    };
    assert_eq!(owners("mirrorHTTPFlow"), vec!["mitm-plugin".to_string()]);
    assert_eq!(owners("handle"), vec!["scan-plugin".to_string()]);
    assert_eq!(owners("execNuclei"), vec!["[cve-2024-0001]".to_string()]);

    let nuclei_params = loader
        .bindings()
        .last()
        .and_then(|b| b.get(PARAMS_BINDING).cloned())
        .unwrap();
    match nuclei_params {
        HookValue::Map(map) => assert_eq!(
            map.get(NUCLEI_TEMPLATE_PARAM),
            Some(&HookValue::Str("[cve-2024-0001]".into()))
        ),
        other => panic!("unexpected params binding {:?}", other),
    }
}

#[tokio::test]
async fn test_nasl_failure_is_reported_not_returned() {
    let (sink, logs) = collecting_sink();
    let mix = MixPluginCaller::builder()
        .with_loader(Arc::new(StaticLoader::new()))
        .with_feedback(sink)
        .build()
        .unwrap();
    let ctx = mix.context();

    mix.load_plugin_by_name(&ctx, "__NaslScript__ssh-weak.nasl", &PluginParams::new(), None)
        .await
        .unwrap();

    assert!(!mix.dispatcher().should_call_by_name("execNasl"));
    let logs = logs.lock();
    assert!(logs.iter().any(|l| l.data.contains("nasl") && l.data.contains("failed")));
}

#[tokio::test]
async fn test_inline_code_and_hot_patch() {
    let hits: Hits = Arc::default();
    let plugin = NativeUnit::new()
        .with_symbol("mirrorNewWebsite", recorder(hits.clone(), "plugin"))
        .with_symbol("hijackHTTPRequest", recorder(hits.clone(), "plugin-hijack"));
    let patch = NativeUnit::new().with_symbol("mirrorNewWebsite", recorder(hits.clone(), "patch"));
    let loader = StaticLoader::new()
        .with_unit("plugin-code", plugin)
        .with_unit("patch-code", patch);
    let mix = MixPluginCaller::builder()
        .with_loader(Arc::new(loader))
        .build()
        .unwrap();
    let ctx = mix.context();

    mix.load_plugin_by_name(&ctx, "inline", &PluginParams::new(), Some("plugin-code"))
        .await
        .unwrap();
    assert!(mix.dispatcher().should_call_by_name("hijackHTTPRequest"));

    mix.mirror_http_flow(false, "http://example.com/", &get("/"), b"", b"", &[]).await;
    assert_eq!(count(&hits, "plugin"), 1);

    // The patch resets the filters, so the same site counts as new again.
    mix.load_hot_patch(&ctx, "patch-code").await.unwrap();
    mix.mirror_http_flow(false, "http://example.com/", &get("/"), b"", b"", &[]).await;
    assert_eq!(count(&hits, "plugin"), 1);
    assert_eq!(count(&hits, "patch"), 1);

    assert!(mix.load_hot_patch(&ctx, "broken-code").await.is_err());
}

#[tokio::test]
async fn test_wait_returns_on_shutdown_with_stuck_scan() {
    let mut config = EngineConfig::default();
    config.mix.scan_port = false;
    let mix = MixPluginCaller::builder().with_config(config).build().unwrap();
    let started = Arc::new(AtomicUsize::new(0));
    let counter = started.clone();
    mix.dispatcher().add_native(
        "scan",
        "execNuclei",
        async_hook_fn(move |_ctx, _args| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                std::future::pending::<()>().await;
                Ok(HookValue::Null)
            }
        }),
    );

    mix.mirror_http_flow(false, "http://stuck.example.com/", &get("/"), b"", b"", &[])
        .await;
    for _ in 0..100 {
        if started.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(started.load(Ordering::SeqCst), 1);

    mix.shutdown();
    let waited = tokio::time::timeout(Duration::from_secs(5), mix.wait()).await;
    assert!(waited.is_ok());
}

#[tokio::test]
async fn test_extra_concurrency_bounds_site_scans() {
    let mut config = EngineConfig::default();
    config.mix.extra_concurrency = 1;
    config.mix.scan_port = false;
    let mix = MixPluginCaller::builder().with_config(config).build().unwrap();

    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));
    let hook = {
        let (in_flight, peak, done) = (in_flight.clone(), peak.clone(), done.clone());
        async_hook_fn(move |_ctx, _args| {
            let (in_flight, peak, done) = (in_flight.clone(), peak.clone(), done.clone());
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
                Ok(HookValue::Null)
            }
        })
    };
    mix.dispatcher().add_native("scan", "execNuclei", hook);

    let sites = ["a", "b", "c", "d", "e"];
    for site in sites {
        let url = format!("http://{}.example.com/", site);
        mix.mirror_http_flow(false, &url, &get("/"), b"", b"", &[]).await;
    }
    mix.wait().await;

    assert_eq!(done.load(Ordering::SeqCst), sites.len());
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}
