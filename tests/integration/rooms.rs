use rocket::http::Status;

use crate::common::test_client;

#[test]
fn create_room_returns_id_and_fingerprint() {
    let client = test_client();
    let res = client.post("/rooms").dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert!(body["room_id"].as_str().unwrap().len() >= 32);
    assert!(!body["fingerprint"].as_str().unwrap().is_empty());
}

#[test]
fn token_for_unknown_room_is_404() {
    let client = test_client();
    let res = client.get("/rooms/does-not-exist/token").dispatch();
    assert_eq!(res.status(), Status::NotFound);
}

#[test]
fn token_for_existing_room_round_trips() {
    let client = test_client();
    let created: serde_json::Value = client.post("/rooms").dispatch().into_json().unwrap();
    let room_id = created["room_id"].as_str().unwrap();

    let res = client.get(format!("/rooms/{room_id}/token")).dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["room_id"], room_id);
    assert!(!body["token"].as_str().unwrap().is_empty());
    assert!(body["exp_unix_ms"].as_i64().unwrap() > 0);
}

#[test]
fn room_creation_rate_limit_returns_json_error_body() {
    let client = test_client();
    let mut tripped = None;
    for _ in 0..200 {
        let res = client.post("/rooms").dispatch();
        if res.status() == Status::TooManyRequests {
            tripped = Some(res);
            break;
        }
    }
    let res = tripped.expect("rate limit never tripped");
    let body: serde_json::Value = res.into_json().unwrap();
    assert!(body["error"].as_str().unwrap().contains("rate limited"));
}

#[test]
fn unknown_route_returns_404_json() {
    let client = test_client();
    let res = client.get("/nope").dispatch();
    assert_eq!(res.status(), Status::NotFound);
    let body: serde_json::Value = res.into_json().unwrap();
    assert!(body["error"].as_str().is_some());
}
