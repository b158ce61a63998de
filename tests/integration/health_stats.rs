use rocket::http::{Header, Status};

use crate::common::test_client;

#[test]
fn health_reports_ok() {
    let client = test_client();
    let res = client.get("/health").dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "ghostline-relay");
}

#[test]
fn live_is_always_ok() {
    let client = test_client();
    let res = client.get("/live").dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["live"], true);
}

#[test]
fn ready_is_true_before_any_store_error() {
    let client = test_client();
    let res = client.get("/ready").dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["ready"], true);
}

#[test]
fn metrics_default_to_prometheus_text() {
    let client = test_client();
    let res = client.get("/metrics").dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body = res.into_string().unwrap();
    assert!(body.contains("relay_connections_current"));
}

#[test]
fn metrics_honors_json_accept_header() {
    let client = test_client();
    let res = client
        .get("/metrics")
        .header(Header::new("Accept", "application/json"))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert!(body.is_object());
}
