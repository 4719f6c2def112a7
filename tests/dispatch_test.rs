//! End-to-end dispatch tests: virtual host resolution, handler chains,
//! geo attachment and access logging, without a network listener.

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use scriptgate::context::REGION_KEY;
use scriptgate::geo::GeoInfo;

mod common;
use common::{body_text, dispatcher, request, request_from, CollectSink, HostSpec, StaticGeo, StaticLoader};

const LOG_FORMAT: &str = "$host $status";

#[tokio::test]
async fn test_unknown_host_is_404() {
    let loader = Arc::new(StaticLoader::new());
    let sink = Arc::new(CollectSink::default());
    let d = dispatcher(loader, LOG_FORMAT, sink.clone());

    let ctx = d.dispatch(request("nobody.test", "/", "")).await;
    assert_eq!(ctx.response().status, StatusCode::NOT_FOUND);
    assert_eq!(body_text(&ctx), "not found");
    assert_eq!(sink.records(), vec!["nobody.test 404".to_string()]);
}

#[tokio::test]
async fn test_not_found_target_serves_unknown_hosts() {
    let loader = Arc::new(
        StaticLoader::new().host("fallback.test", HostSpec::scripts(&["ctx.say('fallback for ', ctx.host)"])),
    );
    let sink = Arc::new(CollectSink::default());
    let d = dispatcher(loader, LOG_FORMAT, sink).with_not_found("fallback.test");

    let ctx = d.dispatch(request("other.test", "/", "")).await;
    assert_eq!(ctx.response().status, StatusCode::OK);
    assert_eq!(body_text(&ctx), "fallback for other.test");
}

#[tokio::test]
async fn test_missing_not_found_target_is_404() {
    let loader = Arc::new(StaticLoader::new());
    let d = dispatcher(loader, LOG_FORMAT, Arc::new(CollectSink::default())).with_not_found("gone.test");

    let ctx = d.dispatch(request("other.test", "/", "")).await;
    assert_eq!(ctx.response().status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_exit_sets_status_and_stops_chain() {
    let loader = Arc::new(StaticLoader::new().host(
        "a.test",
        HostSpec::scripts(&["ctx.say('created'); ctx.exit(201)", "ctx.say('second handler ran')"]),
    ));
    let sink = Arc::new(CollectSink::default());
    let d = dispatcher(loader, LOG_FORMAT, sink.clone());

    let ctx = d.dispatch(request("a.test", "/", "")).await;
    assert_eq!(ctx.response().status, StatusCode::CREATED);
    assert_eq!(body_text(&ctx), "created");
    assert!(ctx.is_eof());
    assert_eq!(sink.records(), vec!["a.test 201".to_string()]);
}

#[tokio::test]
async fn test_chain_runs_in_order_without_eof() {
    let loader = Arc::new(StaticLoader::new().host(
        "a.test",
        HostSpec::scripts(&[
            "ctx.set('step', 'one')",
            "ctx.say(ctx.var('param_step'), ' then two')",
        ]),
    ));
    let d = dispatcher(loader, LOG_FORMAT, Arc::new(CollectSink::default()));

    let ctx = d.dispatch(request("a.test", "/", "")).await;
    assert_eq!(body_text(&ctx), "one then two");
}

#[tokio::test]
async fn test_bind_body_json() {
    let loader = Arc::new(StaticLoader::new().host(
        "a.test",
        HostSpec::scripts(&["local body = ctx.bind_body('json'); ctx.say(body.name, ':', body.count)"]),
    ));
    let d = dispatcher(loader, LOG_FORMAT, Arc::new(CollectSink::default()));

    let ctx = d.dispatch(request("a.test", "/", r#"{"name":"widget","count":3}"#)).await;
    assert_eq!(ctx.response().status, StatusCode::OK);
    assert_eq!(body_text(&ctx), "widget:3");
}

#[tokio::test]
async fn test_bind_body_invalid_json_fails_handler() {
    let loader = Arc::new(StaticLoader::new().host("a.test", HostSpec::scripts(&["ctx.bind_body('json')"])));
    let d = dispatcher(loader, LOG_FORMAT, Arc::new(CollectSink::default()));

    let ctx = d.dispatch(request("a.test", "/", "{bad")).await;
    assert_eq!(ctx.response().status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_text(&ctx), "internal server error");
}

#[tokio::test]
async fn test_pcall_recovers_from_bad_body() {
    let loader = Arc::new(StaticLoader::new().host(
        "a.test",
        HostSpec::scripts(&[
            "local ok = pcall(ctx.bind_body, 'json'); if not ok then ctx.say('bad body'); ctx.exit(400) end",
        ]),
    ));
    let d = dispatcher(loader, LOG_FORMAT, Arc::new(CollectSink::default()));

    let ctx = d.dispatch(request("a.test", "/", "{bad")).await;
    assert_eq!(ctx.response().status, StatusCode::BAD_REQUEST);
    assert_eq!(body_text(&ctx), "bad body");
}

#[tokio::test]
async fn test_script_error_hides_details() {
    let loader = Arc::new(StaticLoader::new().host(
        "a.test",
        HostSpec::scripts(&["ctx.say('partial'); error('secret detail')"]),
    ));
    let sink = Arc::new(CollectSink::default());
    let d = dispatcher(loader, LOG_FORMAT, sink.clone());

    let ctx = d.dispatch(request("a.test", "/", "")).await;
    assert_eq!(ctx.response().status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(!body_text(&ctx).contains("secret"));
    assert_eq!(sink.records(), vec!["a.test 500".to_string()]);
}

#[tokio::test]
async fn test_unserializable_json_is_500_and_logged() {
    let loader = Arc::new(
        StaticLoader::new().host("a.test", HostSpec::scripts(&["ctx.say_json({ f = function() end })"])),
    );
    let sink = Arc::new(CollectSink::default());
    let d = dispatcher(loader, LOG_FORMAT, sink.clone());

    let ctx = d.dispatch(request("a.test", "/", "")).await;
    assert_eq!(ctx.response().status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(sink.records(), vec!["a.test 500".to_string()]);
}

#[tokio::test]
async fn test_odd_header_arguments_change_nothing() {
    let loader = Arc::new(StaticLoader::new().host(
        "a.test",
        HostSpec::scripts(&[
            "local ok = pcall(ctx.set_response_header, 'x-one', '1', 'x-two'); ctx.say(tostring(ok))",
        ]),
    ));
    let d = dispatcher(loader, LOG_FORMAT, Arc::new(CollectSink::default()));

    let ctx = d.dispatch(request("a.test", "/", "")).await;
    assert_eq!(body_text(&ctx), "false");
    assert!(ctx.response().headers.get("x-one").is_none());
    assert!(ctx.response().headers.get("x-two").is_none());
}

#[tokio::test]
async fn test_region_attached_from_remote_addr() {
    let info = GeoInfo {
        city: "Fuzhou".into(),
        city_id: 350100,
        province: "Fujian".into(),
        region: "CN".into(),
        isp: "Telecom".into(),
    };
    let geo = Arc::new(StaticGeo::default().with("1.0.1.7", info.clone()));
    let loader = Arc::new(StaticLoader::new().host(
        "a.test",
        HostSpec {
            region: Some("remote_addr"),
            ..HostSpec::scripts(&["ctx.say(ctx.region_city, '/', ctx.region_raw)"])
        },
    ));
    let d = dispatcher(loader, LOG_FORMAT, Arc::new(CollectSink::default())).with_geo(geo.clone());

    let ctx = d.dispatch(request_from("1.0.1.7:5000", "a.test", "/", "")).await;
    assert_eq!(body_text(&ctx), "Fuzhou/CN|Fujian|Fuzhou|350100|Telecom");
    assert_eq!(ctx.user_value(REGION_KEY).and_then(|v| v.as_region()), Some(&info));
    assert_eq!(geo.calls(), 1);
}

#[tokio::test]
async fn test_short_region_source_is_skipped() {
    let geo = Arc::new(StaticGeo::default());
    let loader = Arc::new(StaticLoader::new().host("a.test", HostSpec::scripts(&["ctx.say('ok')"])));
    let d = dispatcher(loader, LOG_FORMAT, Arc::new(CollectSink::default()))
        .with_geo(geo.clone())
        .with_region("http_x_real_ip");

    let mut ctx = request("a.test", "/", "");
    ctx.headers_mut().insert("x-real-ip", "1.2.3".parse().unwrap());
    let ctx = d.dispatch(ctx).await;

    assert_eq!(geo.calls(), 0);
    assert!(ctx.user_value(REGION_KEY).is_none());
    assert_eq!(body_text(&ctx), "ok");
}

#[tokio::test]
async fn test_failed_geo_lookup_still_serves() {
    let geo = Arc::new(StaticGeo::default());
    let loader = Arc::new(StaticLoader::new().host("a.test", HostSpec::scripts(&["ctx.say('ok')"])));
    let d = dispatcher(loader, LOG_FORMAT, Arc::new(CollectSink::default()))
        .with_geo(geo.clone())
        .with_region("remote_addr");

    let ctx = d.dispatch(request_from("203.0.113.5:1", "a.test", "/", "")).await;
    assert_eq!(geo.calls(), 1);
    assert!(ctx.user_value(REGION_KEY).is_none());
    assert_eq!(ctx.response().status, StatusCode::OK);
}

#[tokio::test]
async fn test_host_access_format_and_output_override() {
    let host_sink = Arc::new(CollectSink::default());
    let loader = Arc::new(StaticLoader::new().host(
        "a.test",
        HostSpec {
            access_format: Some("$method $uri"),
            output: Some(host_sink.clone()),
            ..HostSpec::scripts(&["ctx.say('ok')"])
        },
    ));
    let global_sink = Arc::new(CollectSink::default());
    let d = dispatcher(loader, LOG_FORMAT, global_sink.clone());

    d.dispatch(request("a.test", "/items", "")).await;
    assert_eq!(host_sink.records(), vec!["POST /items".to_string()]);
    assert!(global_sink.records().is_empty());
}

#[tokio::test]
async fn test_script_states_return_to_pool() {
    let loader = Arc::new(StaticLoader::new().host("a.test", HostSpec::scripts(&["ctx.say('ok')"])));
    let d = dispatcher(loader, LOG_FORMAT, Arc::new(CollectSink::default()));

    for _ in 0..3 {
        d.dispatch(request("a.test", "/", "")).await;
    }

    let stats = d.scripts().stats();
    assert_eq!(stats.acquired, 3);
    assert_eq!(stats.released, 3);
    assert_eq!(stats.created, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_load_host_once() {
    let loader = Arc::new(
        StaticLoader::new()
            .host("a.test", HostSpec::scripts(&["ctx.say('ok')"]))
            .with_delay(Duration::from_millis(50)),
    );
    let d = Arc::new(dispatcher(loader.clone(), LOG_FORMAT, Arc::new(CollectSink::default())));

    let tasks: Vec<_> = (0..32)
        .map(|_| {
            let d = Arc::clone(&d);
            tokio::spawn(async move { d.dispatch(request("a.test", "/", "")).await })
        })
        .collect();

    for task in tasks {
        let ctx = task.await.unwrap();
        assert_eq!(ctx.response().status, StatusCode::OK);
    }
    assert_eq!(loader.loads(), 1);
    assert_eq!(d.vhosts().len(), 1);
}

#[tokio::test]
async fn test_handlers_cannot_reach_process_or_files() {
    let loader = Arc::new(StaticLoader::new().host(
        "a.test",
        HostSpec::scripts(&["ctx.say(tostring(io), ' ', tostring(os.execute), ' ', tostring(os.exit), ' ', tostring(dofile))"]),
    ));
    let d = dispatcher(loader, LOG_FORMAT, Arc::new(CollectSink::default()));

    let ctx = d.dispatch(request("a.test", "/", "")).await;
    assert_eq!(ctx.response().status, StatusCode::OK);
    assert_eq!(body_text(&ctx), "nil nil nil nil");
}

#[tokio::test]
async fn test_library_writes_do_not_reach_other_hosts() {
    let loader = Arc::new(
        StaticLoader::new()
            .host(
                "a.test",
                HostSpec::scripts(&[
                    "local ok = pcall(function() string.leak = 'from a' end); ctx.say(tostring(ok), ' ', tostring(getmetatable(_ENV)))",
                ]),
            )
            .host("b.test", HostSpec::scripts(&["ctx.say(tostring(string.leak))"])),
    );
    let d = dispatcher(loader, LOG_FORMAT, Arc::new(CollectSink::default()));

    let ctx = d.dispatch(request("a.test", "/", "")).await;
    assert_eq!(body_text(&ctx), "false false");

    let ctx = d.dispatch(request("b.test", "/", "")).await;
    assert_eq!(body_text(&ctx), "nil");
    assert_eq!(d.scripts().stats().created, 1);
}
