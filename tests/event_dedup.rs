//! Exactly-once relay across redundant streams: claim, drop, steal, and
//! the centralized bot relay mode.

mod common;

use common::{Behavior, SinkEvent, bridge_with, eventually};
use std::time::Duration;

const ALICE: &str = "@alice:example.org";
const BOB: &str = "@bob:example.org";

#[tokio::test]
async fn identical_lines_are_relayed_exactly_once_and_stolen_from_the_dead() {
    let bridge = bridge_with(Behavior::default(), |c| c.bot.enabled = false).await;
    let alice = bridge
        .pool
        .get_or_create_bridged_client(&bridge.server, ALICE, None)
        .await
        .unwrap();
    let _bob = bridge
        .pool
        .get_or_create_bridged_client(&bridge.server, BOB, None)
        .await
        .unwrap();

    let alice_conn = bridge.ircd.conn_of("alice[m]").unwrap();
    let bob_conn = bridge.ircd.conn_of("bob[m]").unwrap();
    let line = ":ext!u@h PRIVMSG #shared :hello";

    // alice's stream sees the line first and claims it
    alice_conn.send(line);
    assert!(
        eventually(Duration::from_secs(3), || bridge.sink.messages().len() == 1).await
    );

    // the duplicate on bob's stream is dropped while alice is alive
    bob_conn.send(line);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(bridge.sink.messages().len(), 1);

    // once the claimer is gone from the pool, the claim is up for theft
    alice.kill(None);
    assert!(
        eventually(Duration::from_secs(3), || {
            bridge
                .pool
                .get_bridged_client_by_nick(&bridge.server, "alice[m]")
                .is_none()
        })
        .await
    );
    bob_conn.send(line);
    assert!(
        eventually(Duration::from_secs(3), || bridge.sink.messages().len() == 2).await,
        "a dead session's claim must be stolen and the line relayed"
    );
}

#[tokio::test]
async fn bot_is_the_single_relay_when_enabled() {
    let bridge = bridge_with(Behavior::default(), |_| {}).await;
    let _bot = bridge.pool.login_to_server(&bridge.server).await;
    let _alice = bridge
        .pool
        .get_or_create_bridged_client(&bridge.server, ALICE, None)
        .await
        .unwrap();

    let line = ":ext!u@h PRIVMSG #shared :hi all";
    bridge.ircd.send_to_all(line);
    assert!(
        eventually(Duration::from_secs(3), || bridge.sink.messages().len() == 1).await
    );

    // a line only the user's stream sees is not relayed at all
    bridge
        .ircd
        .conn_of("alice[m]")
        .unwrap()
        .send(":ext!u@h PRIVMSG #shared :user-only line");
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(bridge.sink.messages().len(), 1);
}

#[tokio::test]
async fn private_messages_bypass_claiming() {
    let bridge = bridge_with(Behavior::default(), |c| c.bot.enabled = false).await;
    let _alice = bridge
        .pool
        .get_or_create_bridged_client(&bridge.server, ALICE, None)
        .await
        .unwrap();
    let _bob = bridge
        .pool
        .get_or_create_bridged_client(&bridge.server, BOB, None)
        .await
        .unwrap();

    bridge
        .ircd
        .conn_of("alice[m]")
        .unwrap()
        .send(":ext!u@h PRIVMSG alice[m] :psst");

    assert!(
        eventually(Duration::from_secs(3), || {
            bridge.sink.events().iter().any(|e| matches!(
                e,
                SinkEvent::Private { from, to, text }
                    if from == "ext" && to == "alice[m]" && text == "psst"
            ))
        })
        .await
    );
}

#[tokio::test]
async fn quits_fan_out_to_the_channels_the_user_was_seen_in() {
    let bridge = bridge_with(Behavior::default(), |c| c.bot.enabled = false).await;
    let alice = bridge
        .pool
        .get_or_create_bridged_client(&bridge.server, ALICE, None)
        .await
        .unwrap();
    alice.join_channel("#x", None).await.unwrap();

    let conn = bridge.ircd.conn_of("alice[m]").unwrap();
    // ext joins, then quits; the leave lands on the channel we saw them in
    conn.send(":ext!u@h JOIN :#x");
    conn.send(":ext!u@h QUIT :gone");

    assert!(
        eventually(Duration::from_secs(3), || {
            bridge
                .sink
                .parts()
                .iter()
                .any(|(nick, channel, _)| nick == "ext" && channel == "#x")
        })
        .await
    );
}
