//! End-to-end export scenarios through the full router.

mod common;

use std::io::Read;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use chrono::{Duration, Utc};
use serde_json::json;
use tower::ServiceExt;

use epg_viewer::utils::UrlUtils;
use epg_viewer::web::{AppState, router};

async fn test_app(data_dir: &std::path::Path) -> Router {
    let state = AppState::from_config(common::test_config(data_dir)).unwrap();
    router(state)
}

fn urlencode(raw: &str) -> String {
    url::form_urlencoded::byte_serialize(raw.as_bytes()).collect()
}

async fn get_raw(app: &Router, uri: &str) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec();
    (status, headers, body)
}

async fn post_json(app: &Router, uri: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_string(&body).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(json!({})))
}

fn gunzip(bytes: &[u8]) -> String {
    let mut decoder = flate2::read::GzDecoder::new(bytes);
    let mut out = String::new();
    decoder.read_to_string(&mut out).unwrap();
    out
}

#[tokio::test]
async fn test_minimal_export() {
    let dir = tempfile::tempdir().unwrap();
    let server = common::FeedServer::start().await;
    server.set("/list.m3u", common::RouteSpec::text(common::BBC_PLAYLIST));
    server.set("/epg.xml", common::RouteSpec::text(common::BBC_GUIDE));

    let app = test_app(dir.path()).await;
    let (status, body) = post_json(
        &app,
        "/api/mappings",
        json!({"channelId": "BBC1", "epgChannelId": "bbc1"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let _ = body;

    let uri = format!(
        "/epg.xml?full=1&playlist={}&epg={}",
        urlencode(&server.url("/list.m3u")),
        urlencode(&server.url("/epg.xml"))
    );
    let (status, headers, body) = get_raw(&app, &uri).await;
    assert_eq!(status, StatusCode::OK);
    assert!(
        headers[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("application/xml")
    );

    let xml = String::from_utf8(body).unwrap();
    assert!(xml.contains("<tv generator-info-name=\"epg-viewer export\">"));
    assert!(xml.contains("<channel id=\"BBC1\">"));
    assert!(xml.contains("<display-name>BBC One</display-name>"));
    assert!(xml.contains("<title>News</title>"));
    // Zero-shift pass-through keeps the wall digits; the global
    // normalization rewrites only the numeric offset
    assert!(xml.contains("start=\"20240610120000 +0000\""));
    assert!(xml.contains("stop=\"20240610130000 +0000\""));
}

#[tokio::test]
async fn test_offset_mode_digits_preserved_and_normalized() {
    let dir = tempfile::tempdir().unwrap();
    let server = common::FeedServer::start().await;
    server.set("/list.m3u", common::RouteSpec::text(common::BBC_PLAYLIST));
    let guide = r#"<tv>
  <channel id="bbc1"><display-name>BBC 1</display-name></channel>
  <programme channel="bbc1" start="20240610120000 +0200"><title>Show</title></programme>
</tv>"#;
    server.set("/epg.xml", common::RouteSpec::text(guide));

    let app = test_app(dir.path()).await;
    post_json(
        &app,
        "/api/mappings",
        json!({
            "channelId": "BBC1",
            "epgChannelId": "bbc1",
            "offsetMinutes": 30,
            "shiftMode": "offset"
        }),
    )
    .await;

    let uri = format!(
        "/epg.xml?full=1&playlist={}&epg={}",
        urlencode(&server.url("/list.m3u")),
        urlencode(&server.url("/epg.xml"))
    );
    let (status, _, body) = get_raw(&app, &uri).await;
    assert_eq!(status, StatusCode::OK);
    let xml = String::from_utf8(body).unwrap();
    // Digits unchanged; the adjusted numeric offset is collapsed to
    // +0000 by the global rule
    assert!(xml.contains("start=\"20240610120000 +0000\""));
}

#[tokio::test]
async fn test_multi_source_merge_without_cross_contamination() {
    let dir = tempfile::tempdir().unwrap();
    let server = common::FeedServer::start().await;
    let playlist = "#EXTM3U\n#EXTINF:-1 tvg-id=\"A\",Alpha\nhttp://s/a\n#EXTINF:-1 tvg-id=\"B\",Beta\nhttp://s/b\n";
    server.set("/list.m3u", common::RouteSpec::text(playlist));
    server.set(
        "/s1.xml",
        common::RouteSpec::text(
            r#"<tv><programme channel="a1" start="20240610200000 +0000"><title>Alpha Show</title></programme></tv>"#,
        ),
    );
    server.set(
        "/default.xml",
        common::RouteSpec::text(
            r#"<tv><programme channel="b" start="20240610200000 +0000"><title>Beta Show</title></programme>
<programme channel="a1" start="20240610200000 +0000"><title>Wrong Alpha</title></programme></tv>"#,
        ),
    );

    let app = test_app(dir.path()).await;
    let (_, source) = post_json(
        &app,
        "/api/sources",
        json!({"url": server.url("/s1.xml")}),
    )
    .await;
    let source_id = source["id"].as_str().unwrap();
    post_json(
        &app,
        "/api/mappings",
        json!({"channelId": "A", "sourceId": source_id, "epgChannelId": "a1"}),
    )
    .await;

    let uri = format!(
        "/epg.xml?full=1&playlist={}&epg={}",
        urlencode(&server.url("/list.m3u")),
        urlencode(&server.url("/default.xml"))
    );
    let (status, _, body) = get_raw(&app, &uri).await;
    assert_eq!(status, StatusCode::OK);
    let xml = String::from_utf8(body).unwrap();

    assert!(xml.contains("<title>Alpha Show</title>"));
    assert!(xml.contains("<title>Beta Show</title>"));
    // The default feed's a1 entry must not leak into channel A, whose
    // mapping routes to source S1
    assert!(!xml.contains("Wrong Alpha"));
    assert!(xml.contains("channel=\"A\""));
    assert!(xml.contains("channel=\"B\""));
}

#[tokio::test]
async fn test_backfill_recovers_history_from_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let server = common::FeedServer::start().await;
    server.set("/list.m3u", common::RouteSpec::text(common::BBC_PLAYLIST));

    let now = Utc::now();
    let recent_start = (now - Duration::hours(2)).format("%Y%m%d%H%M%S").to_string();
    let old_start = (now - Duration::days(3)).format("%Y%m%d%H%M%S").to_string();

    let current_guide = format!(
        r#"<tv><programme channel="bbc1" start="{recent_start} +0000"><title>Recent</title></programme></tv>"#
    );
    server.set("/epg.xml", common::RouteSpec::text(&current_guide));

    let epg_url = server.url("/epg.xml");
    let key = UrlUtils::mirror_key(&epg_url);
    let mirror_dir = dir.path().join("mirror");
    std::fs::create_dir_all(&mirror_dir).unwrap();
    let snapshot_guide = format!(
        r#"<tv><programme channel="bbc1" start="{old_start} +0000"><title>Historical</title></programme></tv>"#
    );
    let stamp = (now - Duration::days(2)).format("%Y%m%d%H%M%S").to_string();
    std::fs::write(
        mirror_dir.join(format!("{key}.{stamp}.xmltv")),
        &snapshot_guide,
    )
    .unwrap();

    let app = test_app(dir.path()).await;
    post_json(
        &app,
        "/api/mappings",
        json!({"channelId": "BBC1", "epgChannelId": "bbc1"}),
    )
    .await;

    let uri = format!(
        "/epg.xml?pastDays=7&futureDays=3&playlist={}&epg={}",
        urlencode(&server.url("/list.m3u")),
        urlencode(&epg_url)
    );
    let (status, _, body) = get_raw(&app, &uri).await;
    assert_eq!(status, StatusCode::OK);
    let xml = String::from_utf8(body).unwrap();

    assert!(xml.contains("<title>Recent</title>"));
    assert!(xml.contains("<title>Historical</title>"));
    // Sorted ascending by start: the historical programme comes first
    let historical_pos = xml.find("Historical").unwrap();
    let recent_pos = xml.find("Recent").unwrap();
    assert!(historical_pos < recent_pos);
}

#[tokio::test]
async fn test_fingerprint_reuse_serves_identical_bytes_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let server = common::FeedServer::start().await;
    server.set("/list.m3u", common::RouteSpec::text(common::BBC_PLAYLIST));
    // A guide around now, so the day window retains it
    let start = (Utc::now() + Duration::hours(1))
        .format("%Y%m%d%H%M%S")
        .to_string();
    let guide = format!(
        r#"<tv><channel id="bbc1"><display-name>BBC 1</display-name></channel>
<programme channel="bbc1" start="{start} +0000"><title>Soon</title></programme></tv>"#
    );
    server.set(
        "/epg.xml",
        common::RouteSpec::text(&guide).with_etag("\"v1\""),
    );

    let app = test_app(dir.path()).await;
    post_json(
        &app,
        "/api/mappings",
        json!({"channelId": "BBC1", "epgChannelId": "bbc1"}),
    )
    .await;

    let uri = format!(
        "/epg.xml.gz?pastDays=7&futureDays=3&playlist={}&epg={}",
        urlencode(&server.url("/list.m3u")),
        urlencode(&server.url("/epg.xml"))
    );

    let (status, headers, first) = get_raw(&app, &uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "application/gzip");
    assert!(
        headers[header::CONTENT_DISPOSITION]
            .to_str()
            .unwrap()
            .contains("attachment")
    );

    let (status, _, second) = get_raw(&app, &uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first, second);

    // Exactly one artifact on disk, and the second request revalidated
    // instead of re-downloading
    let exports: Vec<_> = std::fs::read_dir(dir.path().join("cache").join("exports"))
        .unwrap()
        .flatten()
        .filter(|e| e.path().extension().map(|x| x == "gz").unwrap_or(false))
        .collect();
    assert_eq!(exports.len(), 1);
    assert_eq!(server.hits("/epg.xml"), 2);

    let xml = gunzip(&first);
    assert!(xml.contains("<channel id=\"BBC1\">"));
    assert!(xml.contains("<title>Soon</title>"));
}

#[tokio::test]
async fn test_epg_channel_etag_and_not_modified() {
    let dir = tempfile::tempdir().unwrap();
    let server = common::FeedServer::start().await;
    server.set("/list.m3u", common::RouteSpec::text(common::BBC_PLAYLIST));
    server.set(
        "/epg.xml",
        common::RouteSpec::text(common::BBC_GUIDE).with_etag("\"v1\""),
    );

    let app = test_app(dir.path()).await;
    post_json(
        &app,
        "/api/settings",
        json!({
            "epgUrl": server.url("/epg.xml"),
            "playlistUrl": server.url("/list.m3u"),
            "usePlaylistEpg": true,
            "pastDays": 7,
            "futureDays": 3,
            "historyBackfill": false,
            "historyRetentionDays": 21
        }),
    )
    .await;
    post_json(
        &app,
        "/api/mappings",
        json!({"channelId": "BBC1", "epgChannelId": "bbc1"}),
    )
    .await;

    // A fixed window keeps the fingerprint stable across both requests
    let from = chrono::DateTime::parse_from_rfc3339("2024-06-01T00:00:00Z")
        .unwrap()
        .timestamp_millis();
    let to = chrono::DateTime::parse_from_rfc3339("2024-06-20T00:00:00Z")
        .unwrap()
        .timestamp_millis();
    let uri = format!("/api/epg/channel?id=BBC1&from={from}&to={to}");

    let (status, headers, body) = get_raw(&app, &uri).await;
    assert_eq!(status, StatusCode::OK);
    let etag = headers[header::ETAG].to_str().unwrap().to_string();
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["channel"], "BBC1");
    assert_eq!(parsed["programmes"].as_array().unwrap().len(), 1);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(&uri)
                .header(header::IF_NONE_MATCH, &etag)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
}

#[tokio::test]
async fn test_rescan_and_cached_channel_list() {
    let dir = tempfile::tempdir().unwrap();
    let server = common::FeedServer::start().await;
    server.set("/epg.xml", common::RouteSpec::text(common::BBC_GUIDE));

    let app = test_app(dir.path()).await;
    let (_, source) = post_json(
        &app,
        "/api/sources",
        json!({"url": server.url("/epg.xml")}),
    )
    .await;
    let id = source["id"].as_str().unwrap();

    let (status, result) =
        post_json(&app, &format!("/api/sources/{id}/rescan"), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["channelCount"], 1);

    let (status, _, body) = get_raw(&app, &format!("/api/sources/{id}/channels")).await;
    assert_eq!(status, StatusCode::OK);
    let cached: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(cached["channels"][0]["id"], "bbc1");
    assert_eq!(cached["channels"][0]["displayName"], "BBC 1");
}

#[tokio::test]
async fn test_prewarm_job_reaches_done_and_status_resolves() {
    let dir = tempfile::tempdir().unwrap();
    let server = common::FeedServer::start().await;
    server.set("/list.m3u", common::RouteSpec::text(common::BBC_PLAYLIST));
    server.set("/epg.xml", common::RouteSpec::text(common::BBC_GUIDE));

    let app = test_app(dir.path()).await;
    let (status, ticket) = post_json(
        &app,
        "/api/export/prewarm",
        json!({
            "full": true,
            "playlist": server.url("/list.m3u"),
            "epg": server.url("/epg.xml")
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ticket["started"], true);
    let key = ticket["key"].as_str().unwrap().to_string();
    assert!(ticket["exportUrl"].as_str().unwrap().starts_with("/epg.xml.gz"));

    // Poll until the background job settles
    let mut last = json!({});
    for _ in 0..100 {
        let (status, body) =
            get_json(&app, &format!("/api/export/status?key={key}")).await;
        assert_eq!(status, StatusCode::OK);
        last = body;
        if last["status"] == "done" || last["status"] == "error" {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    assert_eq!(last["status"], "done", "job did not finish: {last}");
    assert_eq!(last["percent"], 100);

    // The fingerprint alias resolves to the same record
    let alias = last["aliasKey"].as_str().unwrap().to_string();
    let (status, by_alias) =
        get_json(&app, &format!("/api/export/status?key={alias}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(by_alias["status"], "done");

    // The artifact it built is on disk and valid
    let exports: Vec<_> = std::fs::read_dir(dir.path().join("cache").join("exports"))
        .unwrap()
        .flatten()
        .collect();
    assert_eq!(exports.len(), 1);
    assert!(exports[0].metadata().unwrap().len() > 100);
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let (status, _, body) = get_raw(app, uri).await;
    (status, serde_json::from_slice(&body).unwrap_or(json!({})))
}

#[tokio::test]
async fn test_api_epg_returns_merged_schedules() {
    let dir = tempfile::tempdir().unwrap();
    let server = common::FeedServer::start().await;
    server.set("/list.m3u", common::RouteSpec::text(common::BBC_PLAYLIST));
    // A programme inside the default window so /api/epg picks it up
    let now = Utc::now();
    let start = (now + Duration::hours(1)).format("%Y%m%d%H%M%S").to_string();
    let guide = format!(
        r#"<tv><channel id="bbc1"><display-name>BBC 1</display-name></channel>
<programme channel="bbc1" start="{start} +0000"><title>Soon</title></programme></tv>"#
    );
    server.set("/epg.xml", common::RouteSpec::text(&guide));

    let app = test_app(dir.path()).await;
    post_json(
        &app,
        "/api/mappings",
        json!({"channelId": "BBC1", "epgChannelId": "bbc1"}),
    )
    .await;

    let uri = format!(
        "/api/epg?playlist={}&epg={}&debug=1",
        urlencode(&server.url("/list.m3u")),
        urlencode(&server.url("/epg.xml"))
    );
    let (status, body) = get_json(&app, &uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["channelOrder"][0], "BBC1");
    assert_eq!(body["schedules"]["BBC1"][0]["title"], "Soon");
    assert!(body["debug"]["groups"].as_array().is_some());
}
