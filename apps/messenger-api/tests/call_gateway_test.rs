mod common;

use serde_json::{json, Value};

use common::*;

async fn call_event(ws: &mut Ws, kind: &str, payload: Value) {
    send_json(ws, json!({ "type": kind, "payload": payload })).await;
}

struct Pair {
    app: TestApp,
    alice: Ws,
    bob: Ws,
}

async fn connected_pair() -> Pair {
    let app = start_server().await;
    let alice_token = app.login("usr_alice", "Alice").await;
    let bob_token = app.login("usr_bob", "Bob").await;
    let alice = app.connect_call(&alice_token, "usr_alice").await;
    let bob = app.connect_call(&bob_token, "usr_bob").await;
    Pair { app, alice, bob }
}

/// Alice rings Bob; returns the call id both sides saw.
async fn ring(pair: &mut Pair) -> String {
    call_event(&mut pair.alice, "start_call", json!({ "peer_id": "usr_bob" })).await;

    let started = next_of_type(&mut pair.alice, "call_started").await;
    let incoming = next_of_type(&mut pair.bob, "incoming_call").await;
    assert_eq!(incoming["payload"]["from_user_id"], "usr_alice");
    assert_eq!(started["payload"]["peer_id"], "usr_bob");
    assert_eq!(started["payload"]["call_id"], incoming["payload"]["call_id"]);

    started["payload"]["call_id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn accepted_call_relays_offer_and_answer() {
    let mut pair = connected_pair().await;
    let call_id = ring(&mut pair).await;

    call_event(&mut pair.bob, "accept_call", json!({ "call_id": call_id })).await;
    let accepted = next_of_type(&mut pair.alice, "call_accepted").await;
    assert_eq!(accepted["payload"]["call_id"], call_id.as_str());
    next_of_type(&mut pair.bob, "call_accepted").await;

    let sdp = json!({ "type": "offer", "sdp": "v=0..." });
    call_event(&mut pair.alice, "offer", json!({ "call_id": call_id, "sdp": sdp })).await;
    let offer = next_of_type(&mut pair.bob, "offer").await;
    assert_eq!(offer["payload"]["sdp"], sdp);
    assert_eq!(offer["payload"]["from_user_id"], "usr_alice");

    call_event(&mut pair.bob, "answer", json!({ "call_id": call_id, "sdp": { "type": "answer" } })).await;
    let answer = next_of_type(&mut pair.alice, "answer").await;
    assert_eq!(answer["payload"]["from_user_id"], "usr_bob");

    call_event(&mut pair.alice, "hangup", json!({ "call_id": call_id })).await;
    let hangup = next_of_type(&mut pair.bob, "hangup").await;
    assert_eq!(hangup["payload"]["from_user_id"], "usr_alice");
    assert!(pair.app.state.call_hub.call(&call_id).unwrap().is_ended());
}

#[tokio::test]
async fn ice_candidates_flow_while_ringing() {
    let mut pair = connected_pair().await;
    let call_id = ring(&mut pair).await;

    let candidate = json!({ "candidate": "candidate:1 1 udp 2122260223 10.0.0.1 54321 typ host" });
    call_event(&mut pair.alice, "ice", json!({ "call_id": call_id, "candidate": candidate })).await;

    let ice = next_of_type(&mut pair.bob, "ice").await;
    assert_eq!(ice["payload"]["candidate"], candidate);
    assert_eq!(ice["payload"]["call_id"], call_id.as_str());
}

#[tokio::test]
async fn rejected_call_notifies_caller() {
    let mut pair = connected_pair().await;
    let call_id = ring(&mut pair).await;

    call_event(&mut pair.bob, "reject_call", json!({ "call_id": call_id })).await;

    let rejected = next_of_type(&mut pair.alice, "call_rejected").await;
    assert_eq!(rejected["payload"]["call_id"], call_id.as_str());
}

#[tokio::test]
async fn disconnect_hangs_up_the_peer_once() {
    let mut pair = connected_pair().await;
    let call_id = ring(&mut pair).await;
    call_event(&mut pair.bob, "accept_call", json!({ "call_id": call_id })).await;
    next_of_type(&mut pair.alice, "call_accepted").await;

    drop(pair.bob);

    let hangup = next_of_type(&mut pair.alice, "hangup").await;
    assert_eq!(hangup["payload"]["call_id"], call_id.as_str());
    assert_eq!(hangup["payload"]["reason"], "peer_disconnected");
    assert_silent(&mut pair.alice).await;

    let hub = pair.app.state.call_hub.clone();
    wait_until(|| !hub.is_connected("usr_bob")).await;
    assert!(hub.call(&call_id).unwrap().is_ended());
}

#[tokio::test]
async fn calling_an_offline_user_is_an_error() {
    let mut pair = connected_pair().await;

    call_event(&mut pair.alice, "start_call", json!({ "peer_id": "usr_carol" })).await;

    let err = next_of_type(&mut pair.alice, "error").await;
    assert_eq!(err["payload"]["message"], "user offline");
    assert_eq!(pair.app.state.call_hub.call_count(), 0);
    assert_silent(&mut pair.bob).await;
}

#[tokio::test]
async fn busy_callee_is_reported() {
    let mut pair = connected_pair().await;
    ring(&mut pair).await;

    let carol_token = pair.app.login("usr_carol", "Carol").await;
    let mut carol = pair.app.connect_call(&carol_token, "usr_carol").await;
    call_event(&mut carol, "start_call", json!({ "peer_id": "usr_bob" })).await;

    let err = next_of_type(&mut carol, "error").await;
    assert_eq!(err["payload"]["message"], "user busy");
}

#[tokio::test]
async fn new_connection_supersedes_the_old_one() {
    let app = start_server().await;
    let token = app.login("usr_alice", "Alice").await;
    let mut first = app.connect_call(&token, "usr_alice").await;

    let _second = app.open("/call/ws", &token).await;

    assert_eq!(next_close_code(&mut first).await, 4002);
    assert!(app.state.call_hub.is_connected("usr_alice"));
    assert_eq!(app.state.call_hub.connection_count(), 1);
}

#[tokio::test]
async fn call_socket_requires_a_session() {
    let app = start_server().await;

    let err = tokio_tungstenite::connect_async(format!("{}?token=nope", app.url("/call/ws")))
        .await
        .expect_err("upgrade should be refused");
    assert_eq!(rejected_status(err), 401);
}
