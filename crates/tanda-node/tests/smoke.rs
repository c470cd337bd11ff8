//! End-to-end smoke test for tanda-node.
//!
//! Starts a real node process, creates a group, joins three members,
//! confirms deposits, runs a contribution through dual confirmation, and
//! advances the rotation — asserting each step is reflected via JSON-RPC.
//!
//! Run with:
//!   cargo test -p tanda-node --test smoke

use std::net::TcpListener;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

struct NodeGuard {
    child: Child,
    data_dir: PathBuf,
}

impl Drop for NodeGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        let _ = std::fs::remove_dir_all(&self.data_dir);
    }
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

async fn rpc_call(
    client: &reqwest::Client,
    url: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let body = serde_json::json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
        "id": 1
    });
    let resp = client
        .post(url)
        .json(&body)
        .send()
        .await
        .unwrap_or_else(|e| panic!("RPC call {method} failed: {e}"));
    let json: serde_json::Value = resp.json().await.expect("parse RPC JSON");
    if let Some(err) = json.get("error") {
        panic!("RPC error from {method}: {err}");
    }
    json["result"].clone()
}

async fn wait_for_rpc(client: &reqwest::Client, url: &str, timeout: Duration) -> bool {
    let body = serde_json::json!({
        "jsonrpc": "2.0",
        "method": "tanda_audit",
        "params": [null],
        "id": 1
    });
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Ok(resp) = client.post(url).json(&body).send().await {
            if resp.status().is_success() {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    false
}

#[tokio::test]
async fn smoke_create_group_join_contribute_advance() {
    let data_dir = std::env::temp_dir().join(format!("tanda_e2e_{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&data_dir);
    std::fs::create_dir_all(&data_dir).unwrap();

    let rpc_port = free_port();
    let rpc_url = format!("http://127.0.0.1:{}", rpc_port);

    let node_bin = env!("CARGO_BIN_EXE_tanda-node");
    let child = Command::new(node_bin)
        .args([
            "--data-dir",
            data_dir.join("state").to_str().unwrap(),
            "--rpc-addr",
            &format!("127.0.0.1:{}", rpc_port),
        ])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn tanda-node");

    let _guard = NodeGuard { child, data_dir };

    let http = reqwest::Client::new();
    assert!(
        wait_for_rpc(&http, &rpc_url, Duration::from_secs(20)).await,
        "tanda-node did not become ready within 20 seconds"
    );

    // ── Create a 3-member weekly group ────────────────────────────────────────
    let group_id = rpc_call(
        &http,
        &rpc_url,
        "tanda_createGroup",
        serde_json::json!([{
            "name": "weekly-circle",
            "admin_ref": "admin-1",
            "contribution_amount_cents": 10_000,
            "period": "weekly",
            "member_limit": 3,
            "deposit_multiplier": "1.0",
            "tier": "basic",
        }]),
    )
    .await;
    let group_id = group_id.as_str().expect("group id string").to_string();

    // ── Join three members ────────────────────────────────────────────────────
    let join = |user: &'static str| {
        let http = http.clone();
        let rpc_url = rpc_url.clone();
        let group_id = group_id.clone();
        async move {
            rpc_call(
                &http,
                &rpc_url,
                "tanda_joinGroup",
                serde_json::json!([{
                    "group_id": group_id,
                    "external_user_ref": user,
                    "preferred_position": null,
                }]),
            )
            .await
        }
    };
    let m1 = join("user-1").await;
    let m2 = join("user-2").await;
    let m3 = join("user-3").await;

    let member_id = |r: &serde_json::Value| r["member_id"].as_str().unwrap().to_string();
    let required_cents = |r: &serde_json::Value| r["required_deposit_cents"].as_i64().unwrap();

    let m1_id = member_id(&m1);
    let m2_id = member_id(&m2);
    let m3_id = member_id(&m3);

    // Position 1 needs the largest deposit (2x contribution), position 3 none.
    assert_eq!(required_cents(&m1), 20_000);
    assert_eq!(required_cents(&m3), 0);

    // ── Confirm each member's deposit in full ────────────────────────────────
    for (member_id, amount_cents) in [
        (&m1_id, required_cents(&m1)),
        (&m2_id, required_cents(&m2)),
        (&m3_id, required_cents(&m3).max(1)),
    ] {
        rpc_call(
            &http,
            &rpc_url,
            "tanda_confirmDeposit",
            serde_json::json!([{
                "member_id": member_id,
                "admin_ref": "admin-1",
                "amount_cents": amount_cents,
                "reference": "seed-deposit",
            }]),
        )
        .await;
    }

    // ── Record and confirm a contribution from member 2 to member 1 ─────────
    let tx_id = rpc_call(
        &http,
        &rpc_url,
        "tanda_recordContribution",
        serde_json::json!([{
            "group_id": group_id,
            "rotation_index": 0,
            "from_member": m2_id,
            "to_member": m1_id,
            "amount_cents": 10_000,
            "external_ref": "week-1",
        }]),
    )
    .await;
    let tx_id = tx_id.as_str().unwrap().to_string();

    let after_sender = rpc_call(
        &http,
        &rpc_url,
        "tanda_confirmContribution",
        serde_json::json!([{
            "transaction_id": tx_id,
            "party": "sender",
            "actor_ref": "user-2",
        }]),
    )
    .await;
    assert_eq!(after_sender["sender_confirmed"], true);
    assert_eq!(after_sender["recipient_confirmed"], false);

    let after_recipient = rpc_call(
        &http,
        &rpc_url,
        "tanda_confirmContribution",
        serde_json::json!([{
            "transaction_id": tx_id,
            "party": "recipient",
            "actor_ref": "user-1",
        }]),
    )
    .await;
    assert_eq!(after_recipient["status"], "BothConfirmed");

    // ── Advance the rotation now that the turn's contribution is settled ────
    let new_index = rpc_call(
        &http,
        &rpc_url,
        "tanda_advanceRotation",
        serde_json::json!([{
            "group_id": group_id,
            "expected_index": 0,
        }]),
    )
    .await;
    assert_eq!(new_index.as_i64(), Some(1));

    // ── A fresh audit scan should turn up no findings on this clean state ───
    let report = rpc_call(&http, &rpc_url, "tanda_audit", serde_json::json!([null])).await;
    assert_eq!(report["findings"].as_array().unwrap().len(), 0);
}
