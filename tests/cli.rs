use assert_cmd::prelude::*;
use secp256k1::{Keypair, Message, Secp256k1};
use sha2::{Digest, Sha256};
use std::{
    fs,
    process::Command,
    time::{SystemTime, UNIX_EPOCH},
};
use tempfile::TempDir;

fn write_env(dir: &TempDir) -> String {
    let env_path = dir.path().join("env");
    let content = format!(
        "DB_PATH={}\nBIND_HTTP=127.0.0.1:0\nBIND_WS=127.0.0.1:0\n",
        dir.path().join("relay.db").display()
    );
    fs::write(&env_path, content).unwrap();
    env_path.to_str().unwrap().to_string()
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

fn signed_event_json(kind: u32, content: &str) -> serde_json::Value {
    let secp = Secp256k1::new();
    let sk = [1u8; 32];
    let kp = Keypair::from_seckey_slice(&secp, &sk).unwrap();
    let pubkey = hex::encode(kp.x_only_public_key().0.serialize());
    let created_at = now();
    let tags: Vec<Vec<String>> = vec![];
    let arr = serde_json::json!([0, pubkey, created_at, kind, tags, content]);
    let data = serde_json::to_vec(&arr).unwrap();
    let hash = Sha256::digest(&data);
    let id = hex::encode(hash);
    let msg = Message::from_digest_slice(&hash).unwrap();
    let sig = secp.sign_schnorr_no_aux_rand(&msg, &kp);
    serde_json::json!({
        "id": id,
        "pubkey": pubkey,
        "kind": kind,
        "created_at": created_at,
        "tags": tags,
        "content": content,
        "sig": hex::encode(sig.as_ref()),
    })
}

fn strand() -> Command {
    Command::cargo_bin("strand").unwrap()
}

fn write_event(dir: &TempDir, name: &str, ev: &serde_json::Value) -> String {
    let path = dir.path().join(name);
    fs::write(&path, serde_json::to_string(ev).unwrap()).unwrap();
    path.to_str().unwrap().to_string()
}

#[test]
fn init_and_ingest_cli_store_event() {
    let dir = TempDir::new().unwrap();
    let env_path = write_env(&dir);

    strand().args(["--env", &env_path, "init"]).assert().success();
    assert!(dir.path().join("relay.db").exists());

    let ev = signed_event_json(1, "hello");
    let ev_path = write_event(&dir, "ev.json", &ev);
    strand()
        .args(["--env", &env_path, "ingest", &ev_path])
        .assert()
        .success();

    let conn = rusqlite::Connection::open(dir.path().join("relay.db")).unwrap();
    let content: String = conn
        .query_row(
            "SELECT content FROM event WHERE id = ?1",
            [ev["id"].as_str().unwrap()],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(content, "hello");
}

#[test]
fn ingest_cli_rejects_invalid_events() {
    let dir = TempDir::new().unwrap();
    let env_path = write_env(&dir);

    let mut bad = signed_event_json(1, "");
    bad["id"] = serde_json::Value::String("ff".repeat(32));
    let bad_path = write_event(&dir, "bad.json", &bad);
    strand()
        .args(["--env", &env_path, "ingest", &bad_path])
        .assert()
        .failure();

    let unsupported = signed_event_json(40_000, "");
    let unsupported_path = write_event(&dir, "unsupported.json", &unsupported);
    strand()
        .args(["--env", &env_path, "ingest", &unsupported_path])
        .assert()
        .failure();
}

#[test]
fn verify_cli_success_and_failure() {
    let dir = TempDir::new().unwrap();
    let env_path = write_env(&dir);

    let good = signed_event_json(1, "genuine");
    let good_path = write_event(&dir, "good.json", &good);
    strand()
        .args(["--env", &env_path, "ingest", &good_path])
        .assert()
        .success();

    strand()
        .args(["--env", &env_path, "verify", "--sample", "10"])
        .assert()
        .success();

    // tamper with the stored row behind the relay's back
    let conn = rusqlite::Connection::open(dir.path().join("relay.db")).unwrap();
    conn.execute("UPDATE event SET content = 'forged'", []).unwrap();
    drop(conn);

    strand()
        .args(["--env", &env_path, "verify", "--sample", "10"])
        .assert()
        .failure();
}

#[test]
fn cli_help_lists_commands() {
    let output = strand()
        .arg("--help")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).unwrap();
    for cmd in ["init", "ingest", "serve", "verify"] {
        assert!(text.contains(cmd));
    }
}

#[test]
fn cli_help_subcommand_still_works() {
    let output = strand()
        .args(["help", "verify"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).unwrap();
    assert!(text.contains("--sample"));
}
