use std::{fs, time};

use anyhow::Context;
use ntest::timeout;
use serde_json::json;

mod support;

#[test]
#[timeout(30000)]
fn corrupt_catalogue_is_quarantined() -> anyhow::Result<()> {
    let tmp_dir = tempfile::Builder::new()
        .prefix("codewire-test")
        .rand_bytes(12)
        .tempdir()
        .context("creating tmp dir")?;
    let data_dir = tmp_dir.path().join("data");
    fs::create_dir_all(&data_dir)?;
    fs::write(data_dir.join("sessions.json"), b"invalid json{[[")?;

    let daemon = support::daemon::Proc::launch(&data_dir)?;
    let mut client = daemon.connect()?;

    let resp = client.expect(json!({ "type": "ListSessions" }), "SessionList")?;
    assert_eq!(resp["sessions"].as_array().map(Vec::len), Some(0));

    let quarantined: Vec<_> = fs::read_dir(&data_dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("sessions.json.corrupt-"))
        .collect();
    assert_eq!(quarantined.len(), 1, "expected exactly one quarantine file");

    // the node is fully usable afterwards
    client.expect(json!({ "type": "Launch", "cmd": ["bash", "-c", "true"] }), "Launched")?;

    Ok(())
}

#[test]
#[timeout(60000)]
fn completed_sessions_survive_a_restart() -> anyhow::Result<()> {
    let tmp_dir = tempfile::Builder::new()
        .prefix("codewire-test")
        .rand_bytes(12)
        .tempdir()
        .context("creating tmp dir")?;
    let data_dir = tmp_dir.path().join("data");

    let (completed_id, running_id) = {
        let mut daemon = support::daemon::Proc::launch(&data_dir)?;
        let mut client = daemon.connect()?;

        let completed_id = client
            .expect(
                json!({ "type": "Launch", "cmd": ["bash", "-c", "true"], "name": "done" }),
                "Launched",
            )?["session_id"]
            .as_u64()
            .unwrap();
        client.expect(
            json!({ "type": "Wait", "session_id": completed_id, "condition": "all", "timeout_s": 5 }),
            "WaitResult",
        )?;

        let running_id = client
            .expect(json!({ "type": "Launch", "cmd": ["sleep", "60"] }), "Launched")?
            ["session_id"]
            .as_u64()
            .unwrap();

        // wait for the debounced flush to record the running session,
        // then kill the daemon without ceremony to simulate a crash
        let catalogue = daemon.data_dir.join("sessions.json");
        let recorded = support::wait_until(time::Duration::from_secs(2), || {
            fs::read(&catalogue)
                .ok()
                .and_then(|bytes| serde_json::from_slice::<serde_json::Value>(&bytes).ok())
                .map(|records| records.as_array().map(Vec::len) == Some(2))
                .unwrap_or(false)
        });
        assert!(recorded, "catalogue never recorded both sessions");
        daemon.kill_hard()?;
        (completed_id, running_id)
    };

    let daemon = support::daemon::Proc::launch(&data_dir)?;
    let mut client = daemon.connect()?;
    let resp = client.expect(json!({ "type": "ListSessions" }), "SessionList")?;
    let sessions = resp["sessions"].as_array().expect("sessions");

    let completed = sessions
        .iter()
        .find(|s| s["id"].as_u64() == Some(completed_id))
        .expect("completed session restored");
    assert_eq!(completed["status"], "completed");
    assert_eq!(completed["exit_code"].as_i64(), Some(0));
    assert_eq!(completed["name"], "done");

    // the previously running session is back as killed, since no pty
    // from the prior run survives
    let killed = sessions
        .iter()
        .find(|s| s["id"].as_u64() == Some(running_id))
        .expect("running session restored in killed state");
    assert_eq!(killed["status"], "killed");
    assert_eq!(killed["exit_code"].as_i64(), Some(-1));

    // and new ids do not collide with restored ones
    let fresh = client
        .expect(json!({ "type": "Launch", "cmd": ["bash", "-c", "true"] }), "Launched")?
        ["session_id"]
        .as_u64()
        .unwrap();
    assert!(fresh > running_id);

    Ok(())
}

#[test]
#[timeout(30000)]
fn catalogue_lands_on_disk_within_a_second() -> anyhow::Result<()> {
    let daemon = support::daemon::Proc::new().context("starting daemon proc")?;
    let mut client = daemon.connect()?;

    client.expect(json!({ "type": "Launch", "cmd": ["sleep", "30"] }), "Launched")?;

    let catalogue = daemon.data_dir.join("sessions.json");
    let written = support::wait_until(time::Duration::from_secs(2), || catalogue.exists());
    assert!(written, "catalogue was not flushed after the debounce window");

    let records: serde_json::Value = serde_json::from_slice(&fs::read(&catalogue)?)?;
    let records = records.as_array().expect("an array of session records");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["status"], "running");

    client.expect(json!({ "type": "KillAll" }), "KilledAll")?;
    Ok(())
}

#[test]
#[timeout(30000)]
fn kill_all_evicts_terminal_sessions() -> anyhow::Result<()> {
    let daemon = support::daemon::Proc::new().context("starting daemon proc")?;
    let mut client = daemon.connect()?;

    let id = client
        .expect(json!({ "type": "Launch", "cmd": ["bash", "-c", "true"] }), "Launched")?
        ["session_id"]
        .as_u64()
        .unwrap();
    client.expect(
        json!({ "type": "Wait", "session_id": id, "condition": "all", "timeout_s": 5 }),
        "WaitResult",
    )?;

    // terminal sessions stay listed until an explicit kill --all
    let resp = client.expect(json!({ "type": "ListSessions" }), "SessionList")?;
    assert_eq!(resp["sessions"].as_array().map(Vec::len), Some(1));

    let resp = client.expect(json!({ "type": "KillAll" }), "KilledAll")?;
    assert!(resp["killed"].as_array().unwrap().iter().any(|v| v.as_u64() == Some(id)));

    let resp = client.expect(json!({ "type": "ListSessions" }), "SessionList")?;
    assert_eq!(resp["sessions"].as_array().map(Vec::len), Some(0));

    Ok(())
}
