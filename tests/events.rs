use anyhow::Context;
use ntest::timeout;
use serde_json::json;

mod support;

#[test]
#[timeout(30000)]
fn status_events_fire_once_per_transition() -> anyhow::Result<()> {
    let daemon = support::daemon::Proc::new().context("starting daemon proc")?;

    let mut subscriber = daemon.connect()?;
    let resp = subscriber.expect(
        json!({ "type": "Subscribe", "event_types": ["session.status"] }),
        "SubscribeAck",
    )?;
    assert!(resp["subscription_id"].as_u64().is_some());

    let mut client = daemon.connect()?;
    let id = client
        .expect(json!({ "type": "Launch", "cmd": ["bash", "-c", "true"] }), "Launched")?
        ["session_id"]
        .as_u64()
        .unwrap();

    // first the running transition, then exactly one terminal one
    let event = subscriber.recv_control()?;
    assert_eq!(event["type"], "Event");
    assert_eq!(event["event_type"], "session.status");
    assert_eq!(event["data"]["session_id"].as_u64(), Some(id));
    assert_eq!(event["data"]["status"], "running");

    let event = subscriber.recv_control()?;
    assert_eq!(event["event_type"], "session.status");
    assert_eq!(event["data"]["status"], "completed");
    assert_eq!(event["data"]["exit_code"].as_i64(), Some(0));

    Ok(())
}

#[test]
#[timeout(30000)]
fn output_events_are_coalesced_but_present() -> anyhow::Result<()> {
    let daemon = support::daemon::Proc::new().context("starting daemon proc")?;

    let mut subscriber = daemon.connect()?;
    subscriber.expect(
        json!({ "type": "Subscribe", "event_types": ["session.output"] }),
        "SubscribeAck",
    )?;

    let mut client = daemon.connect()?;
    let id = client
        .expect(
            json!({ "type": "Launch", "cmd": ["bash", "-c", "echo chunk; sleep 0.3"] }),
            "Launched",
        )?["session_id"]
        .as_u64()
        .unwrap();

    let event = subscriber.recv_control()?;
    assert_eq!(event["event_type"], "session.output");
    assert_eq!(event["data"]["session_id"].as_u64(), Some(id));
    assert!(event["data"]["output_bytes"].as_u64().unwrap_or(0) > 0);

    Ok(())
}

#[test]
#[timeout(30000)]
fn filters_limit_what_a_subscription_sees() -> anyhow::Result<()> {
    let daemon = support::daemon::Proc::new().context("starting daemon proc")?;

    let mut client = daemon.connect()?;
    let tagged = client
        .expect(
            json!({
                "type": "Launch",
                "cmd": ["bash", "-c", "sleep 0.2"],
                "tags": ["interesting"],
            }),
            "Launched",
        )?["session_id"]
        .as_u64()
        .unwrap();

    let mut subscriber = daemon.connect()?;
    subscriber.expect(
        json!({
            "type": "Subscribe",
            "tags": ["interesting"],
            "event_types": ["session.status"],
        }),
        "SubscribeAck",
    )?;

    // noise from an untagged session must not show up
    client.expect(json!({ "type": "Launch", "cmd": ["bash", "-c", "true"] }), "Launched")?;

    let event = subscriber.recv_control()?;
    assert_eq!(event["data"]["session_id"].as_u64(), Some(tagged));
    assert!(event["data"]["status"].as_str().unwrap_or("").starts_with("completed"));

    Ok(())
}

#[test]
#[timeout(30000)]
fn unsubscribe_stops_delivery_and_reports_drops() -> anyhow::Result<()> {
    let daemon = support::daemon::Proc::new().context("starting daemon proc")?;
    let mut client = daemon.connect()?;

    let resp = client.expect(json!({ "type": "Subscribe" }), "SubscribeAck")?;
    let sub_id = resp["subscription_id"].as_u64().unwrap();

    let resp = client.expect(
        json!({ "type": "Unsubscribe", "subscription_id": sub_id }),
        "Unsubscribed",
    )?;
    assert_eq!(resp["subscription_id"].as_u64(), Some(sub_id));
    assert_eq!(resp["dropped"].as_u64(), Some(0));

    // a second unsubscribe no longer finds it
    let resp = client.request(json!({ "type": "Unsubscribe", "subscription_id": sub_id }))?;
    assert_eq!(resp["type"], "Error");

    Ok(())
}
