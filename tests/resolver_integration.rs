//! Integration tests for the stream resolution protocol.
//!
//! Modules are native closures; episode pages are served by mock HTTP servers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use streamfetch_core::download::HttpClient;
use streamfetch_core::logging::{MemoryLogSink, SharedLogSink};
use streamfetch_core::resolver::{ResolveError, StreamResolver};
use streamfetch_core::retry::RetryPolicy;
use streamfetch_core::script::{
    Deferred, Module, ModuleFlags, ModuleSession, NativeEngine, NativeModule, ScriptHost,
    ScriptValue, entrypoints,
};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const EPISODE_HTML: &str = r#"<html><a data-src="https://cdn.example/ep1/master.m3u8">play</a></html>"#;

fn load(module: NativeModule, flags: ModuleFlags, base_url: &str) -> (ModuleSession, MemoryLogSink) {
    let engine = NativeEngine::new();
    engine.register("demo-script", module);
    let sink = MemoryLogSink::new();
    let shared: SharedLogSink = Arc::new(sink.clone());
    let host = ScriptHost::new(Arc::new(engine), HttpClient::new(), Arc::clone(&shared))
        .with_call_timeout(Duration::from_secs(2));
    let session = host
        .load(Module::new("demo", "demo-script", flags).with_base_url(base_url))
        .expect("module should load");
    (session, sink)
}

fn resolver(sink: &MemoryLogSink) -> StreamResolver {
    StreamResolver::new(HttpClient::new(), Arc::new(sink.clone()))
        .with_document_retry(RetryPolicy::no_retry())
}

fn arg_text(args: &[Value]) -> String {
    args.first()
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

async fn serve_episode(server: &MockServer, expected_fetches: u64) {
    Mock::given(method("GET"))
        .and(path("/watch/ep1"))
        .respond_with(ResponseTemplate::new(200).set_body_string(EPISODE_HTML))
        .expect(expected_fetches)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_sync_module_receives_fetched_page_with_referer() {
    let server = MockServer::start().await;
    let base_url = format!("{}/", server.uri());
    Mock::given(method("GET"))
        .and(path("/watch/ep1"))
        .and(header("Referer", base_url.as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_string(EPISODE_HTML))
        .expect(1)
        .mount(&server)
        .await;

    let module = NativeModule::new().function(entrypoints::EXTRACT_STREAM_URL, |args, _| {
        let html = arg_text(&args);
        let start = html.find("https://").unwrap_or(0);
        let end = html[start..].find('"').map_or(html.len(), |i| start + i);
        Ok(ScriptValue::Immediate(json!({
            "streams": [{ "url": &html[start..end], "headers": { "Referer": "https://site.example/" } }]
        })))
    });
    let (session, sink) = load(module, ModuleFlags::default(), &base_url);

    let result = resolver(&sink)
        .resolve(&session, &format!("{}/watch/ep1", server.uri()), false)
        .await
        .expect("resolution should succeed");

    assert_eq!(result.variants.len(), 1);
    assert_eq!(result.variants[0].url, "https://cdn.example/ep1/master.m3u8");
    assert_eq!(
        result.variants[0].headers.get("Referer").map(String::as_str),
        Some("https://site.example/")
    );
}

#[tokio::test]
async fn test_async_future_method_wins_without_page_fetch() {
    let server = MockServer::start().await;
    serve_episode(&server, 0).await;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);

    let module = NativeModule::new().function(entrypoints::EXTRACT_STREAM_URL, move |args, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        let reference = arg_text(&args);
        Ok(ScriptValue::Deferred(Deferred::resolved(json!({
            "stream": format!("{reference}/stream.m3u8")
        }))))
    });
    let flags = ModuleFlags {
        async_js: true,
        stream_async_js: true,
        ..ModuleFlags::default()
    };
    let (session, sink) = load(module, flags, "");
    let episode = format!("{}/watch/ep1", server.uri());

    let result = resolver(&sink)
        .resolve(&session, &episode, false)
        .await
        .expect("resolution should succeed");

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(result.variants[0].url, format!("{episode}/stream.m3u8"));
}

#[tokio::test]
async fn test_failing_methods_fall_through_in_priority_order() {
    let server = MockServer::start().await;
    serve_episode(&server, 2).await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen);

    let module = NativeModule::new().function(entrypoints::EXTRACT_STREAM_URL, move |args, _| {
        let mut seen = recorder.lock().unwrap();
        seen.push(arg_text(&args));
        match seen.len() {
            1 => Ok(ScriptValue::Deferred(Deferred::rejected("upstream 403"))),
            2 => Ok(ScriptValue::Deferred(Deferred::resolved(json!({})))),
            _ => Ok(ScriptValue::Immediate(json!("https://cdn.example/final.mp4"))),
        }
    });
    let flags = ModuleFlags {
        async_js: true,
        stream_async_js: true,
        ..ModuleFlags::default()
    };
    let (session, sink) = load(module, flags, "");
    let episode = format!("{}/watch/ep1", server.uri());

    let result = resolver(&sink)
        .resolve(&session, &episode, false)
        .await
        .expect("the last method should succeed");

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[0], episode, "method 0 receives the episode reference");
    assert_eq!(seen[1], EPISODE_HTML, "method 1 receives the page");
    assert_eq!(seen[2], EPISODE_HTML, "method 2 receives the page");
    assert_eq!(result.variants[0].url, "https://cdn.example/final.mp4");
}

#[tokio::test]
async fn test_exhaustion_reports_stream_not_found() {
    let server = MockServer::start().await;
    serve_episode(&server, 1).await;
    let module = NativeModule::new().function(entrypoints::EXTRACT_STREAM_URL, |_, _| {
        Ok(ScriptValue::Immediate(Value::Null))
    });
    let (session, sink) = load(module, ModuleFlags::default(), "");
    let episode = format!("{}/watch/ep1", server.uri());

    let err = resolver(&sink)
        .resolve(&session, &episode, false)
        .await
        .expect_err("no method can produce a stream");

    match &err {
        ResolveError::Exhausted { tried_count, .. } => assert_eq!(*tried_count, 1),
        other => panic!("expected Exhausted, got {other:?}"),
    }
    assert!(err.is_not_found());
    assert!(sink.contains(&format!("Stream not found for {episode}")));
}

#[tokio::test]
async fn test_module_without_extractor_is_unsupported() {
    let module = NativeModule::new().function(entrypoints::SEARCH_RESULTS, |_, _| {
        Ok(ScriptValue::Immediate(json!([])))
    });
    let (session, sink) = load(module, ModuleFlags::default(), "");

    let err = resolver(&sink)
        .resolve(&session, "https://site.example/ep/1", false)
        .await
        .expect_err("module cannot extract streams");
    assert!(matches!(err, ResolveError::Unsupported { .. }));
}

#[tokio::test]
async fn test_concurrent_duplicate_requests_share_one_resolution() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let module = NativeModule::new().function(entrypoints::EXTRACT_STREAM_URL, move |args, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptValue::Deferred(Deferred::after(
            Duration::from_millis(50),
            json!({ "stream": format!("{}/s.m3u8", arg_text(&args)) }),
        )))
    });
    let flags = ModuleFlags {
        async_js: true,
        ..ModuleFlags::default()
    };
    let (session, sink) = load(module, flags, "");
    let resolver = resolver(&sink);

    let (first, second) = tokio::join!(
        resolver.resolve(&session, "https://site.example/ep/7", false),
        resolver.resolve(&session, "https://site.example/ep/7", false),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(first.unwrap(), second.unwrap());
    assert_eq!(resolver.in_flight(), 0);

    // A different soft-sub flag is a different request.
    resolver
        .resolve(&session, "https://site.example/ep/7", true)
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_subtitles_kept_only_for_softsub_requests() {
    let module = NativeModule::new().function(entrypoints::EXTRACT_STREAM_URL, |_, _| {
        Ok(ScriptValue::Deferred(Deferred::resolved(json!({
            "stream": "https://cdn.example/ep.m3u8",
            "subtitles": "https://cdn.example/en.vtt"
        }))))
    });
    let flags = ModuleFlags {
        async_js: true,
        softsub: true,
        ..ModuleFlags::default()
    };
    let (session, sink) = load(module, flags, "");
    let resolver = resolver(&sink);

    let plain = resolver
        .resolve(&session, "ep-ref", false)
        .await
        .unwrap();
    assert!(plain.subtitles.is_empty());

    let with_subs = resolver.resolve(&session, "ep-ref", true).await.unwrap();
    assert_eq!(with_subs.subtitles.len(), 1);
    assert_eq!(with_subs.subtitles[0].url, "https://cdn.example/en.vtt");
}

#[tokio::test]
async fn test_immediate_and_deferred_payloads_resolve_identically() {
    fn payload() -> Value {
        json!({
            "streams": [
                { "title": "1080p", "streamUrl": "https://cdn.example/hd.m3u8", "headers": { "Origin": "https://site.example" } },
                { "title": "480p", "streamUrl": "https://cdn.example/sd.m3u8" }
            ],
            "subtitles": "https://cdn.example/en.vtt"
        })
    }
    let flags = ModuleFlags {
        async_js: true,
        softsub: true,
        ..ModuleFlags::default()
    };
    let immediate = NativeModule::new().function(entrypoints::EXTRACT_STREAM_URL, |_, _| {
        Ok(ScriptValue::Immediate(payload()))
    });
    let deferred = NativeModule::new().function(entrypoints::EXTRACT_STREAM_URL, |_, _| {
        Ok(ScriptValue::Deferred(Deferred::resolved(payload())))
    });
    let (immediate_session, immediate_sink) = load(immediate, flags, "");
    let (deferred_session, deferred_sink) = load(deferred, flags, "");

    let from_immediate = resolver(&immediate_sink)
        .resolve(&immediate_session, "ep-ref", true)
        .await
        .expect("immediate payload should resolve");
    let from_deferred = resolver(&deferred_sink)
        .resolve(&deferred_session, "ep-ref", true)
        .await
        .expect("deferred payload should resolve");

    assert_eq!(from_immediate, from_deferred);
    assert_eq!(from_immediate.variants.len(), 2);
    assert_eq!(from_immediate.subtitles.len(), 1);
}

#[tokio::test]
async fn test_unawaited_future_placeholder_moves_to_next_method() {
    let server = MockServer::start().await;
    serve_episode(&server, 1).await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen);

    let module = NativeModule::new().function(entrypoints::EXTRACT_STREAM_URL, move |args, _| {
        let mut seen = recorder.lock().unwrap();
        seen.push(arg_text(&args));
        if seen.len() == 1 {
            Ok(ScriptValue::Immediate(json!("[object Promise]")))
        } else {
            Ok(ScriptValue::Deferred(Deferred::resolved(json!(
                "https://cdn.example/after-placeholder.m3u8"
            ))))
        }
    });
    let flags = ModuleFlags {
        async_js: true,
        stream_async_js: true,
        ..ModuleFlags::default()
    };
    let (session, sink) = load(module, flags, "");
    let episode = format!("{}/watch/ep1", server.uri());

    let result = resolver(&sink)
        .resolve(&session, &episode, false)
        .await
        .expect("second method should resolve");

    assert_eq!(
        result.variants[0].url,
        "https://cdn.example/after-placeholder.m3u8"
    );
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], episode);
    assert_eq!(seen[1], EPISODE_HTML);
}

#[tokio::test]
async fn test_request_after_reload_does_not_join_replaced_flight() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let native = NativeModule::new().function(entrypoints::EXTRACT_STREAM_URL, move |args, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptValue::Deferred(Deferred::after(
            Duration::from_millis(300),
            json!({ "stream": format!("{}/s.m3u8", arg_text(&args)) }),
        )))
    });
    let engine = NativeEngine::new();
    engine.register("demo-script", native);
    let sink = MemoryLogSink::new();
    let host = ScriptHost::new(Arc::new(engine), HttpClient::new(), Arc::new(sink.clone()))
        .with_call_timeout(Duration::from_secs(2));
    let module = Module::new(
        "demo",
        "demo-script",
        ModuleFlags {
            async_js: true,
            ..ModuleFlags::default()
        },
    );
    let resolver = resolver(&sink);

    let replaced = host.load(module.clone()).expect("module should load");
    let stale = {
        let resolver = resolver.clone();
        let session = replaced.clone();
        tokio::spawn(async move { resolver.resolve(&session, "https://site.example/ep/3", false).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(resolver.in_flight(), 1);

    let current = host.load(module).expect("module should reload");
    assert!(current.generation() > replaced.generation());
    let result = resolver
        .resolve(&current, "https://site.example/ep/3", false)
        .await
        .expect("reloaded module should resolve");
    assert_eq!(result.variants[0].url, "https://site.example/ep/3/s.m3u8");

    let stale = stale.await.unwrap();
    assert!(matches!(stale, Err(ResolveError::Discarded { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
