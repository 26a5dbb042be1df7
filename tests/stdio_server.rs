use assert_cmd::Command;
use httpmock::{Method::GET, MockServer};
use predicates::prelude::*;
use serde_json::{json, Value};

fn command(envs: &[(&str, &str)]) -> anyhow::Result<Command> {
    let mut cmd = Command::cargo_bin("danbooru-bridge")?;
    cmd.env_remove("DANBOORU_CONFIG")
        .env_remove("DANBOORU_USERNAME")
        .env_remove("DANBOORU_API_KEY")
        .env_remove("DANBOORU_STATE_PATH");
    for (k, v) in envs {
        cmd.env(k, v);
    }
    cmd.arg("--log-level").arg("warn");
    Ok(cmd)
}

fn run_with_env(req: &Value, envs: &[(&str, &str)]) -> anyhow::Result<Value> {
    let input = serde_json::to_string(req)?;
    let assert = command(envs)?.write_stdin(input).assert().success();
    let output = String::from_utf8(assert.get_output().stdout.clone())?;
    Ok(serde_json::from_str(output.trim())?)
}

#[test]
fn initialize_reports_server_and_upstream() -> anyhow::Result<()> {
    let req = json!({"jsonrpc":"2.0","method":"initialize","id":1,"params":{}});
    let resp = run_with_env(&req, &[("DANBOORU_BASE_URL", "http://127.0.0.1:9")])?;
    assert_eq!(resp["id"], 1);
    assert_eq!(resp["result"]["server"]["name"], "danbooru-bridge");
    assert_eq!(resp["result"]["baseUrl"], "http://127.0.0.1:9");
    assert_eq!(resp["result"]["authenticated"], false);
    Ok(())
}

#[test]
fn services_list_describes_operations() -> anyhow::Result<()> {
    let req = json!({"jsonrpc":"2.0","method":"services/list","id":"a"});
    let resp = run_with_env(&req, &[("DANBOORU_BASE_URL", "http://127.0.0.1:9")])?;
    let ops = resp["result"]["operations"].as_array().unwrap();
    assert!(ops
        .iter()
        .any(|o| o["service"] == "posts" && o["method"] == "list" && o["inputSchema"].is_object()));
    Ok(())
}

#[test]
fn services_call_returns_upstream_data() -> anyhow::Result<()> {
    let server = MockServer::start();
    let m = server.mock(|when, then| {
        when.method(GET)
            .path("/posts.json")
            .query_param("tags", "cat")
            .query_param("limit", "2");
        then.status(200)
            .header("x-rate-limit", r#"{"limit":10,"remaining":8}"#)
            .json_body(json!([{"id": 2}, {"id": 1}]));
    });
    let req = json!({
        "jsonrpc":"2.0","method":"services/call","id":2,
        "params":{"service":"posts","method":"list","arguments":{"tags":"cat","limit":2}}
    });
    let resp = run_with_env(&req, &[("DANBOORU_BASE_URL", server.base_url().as_str())])?;
    m.assert();
    assert_eq!(resp["result"]["status_code"], 200);
    assert_eq!(resp["result"]["from_cache"], false);
    assert_eq!(resp["result"]["data"][0]["id"], 2);
    assert_eq!(resp["result"]["rate_limit"]["remaining"], 8);
    Ok(())
}

#[test]
fn upstream_errors_carry_their_kind() -> anyhow::Result<()> {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/posts/3.json");
        then.status(404).json_body(json!({"success": false, "message": "not found"}));
    });
    let req = json!({
        "jsonrpc":"2.0","method":"services/call","id":3,
        "params":{"service":"posts","method":"get","arguments":{"id":3}}
    });
    let resp = run_with_env(&req, &[("DANBOORU_BASE_URL", server.base_url().as_str())])?;
    assert_eq!(resp["error"]["code"], -32000);
    assert_eq!(resp["error"]["data"]["kind"], "not_found");
    assert_eq!(resp["error"]["data"]["status"], 404);
    Ok(())
}

#[test]
fn unknown_operations_and_methods_are_rejected() -> anyhow::Result<()> {
    let envs = [("DANBOORU_BASE_URL", "http://127.0.0.1:9")];
    let req = json!({
        "jsonrpc":"2.0","method":"services/call","id":4,
        "params":{"service":"posts","method":"__init__"}
    });
    let resp = run_with_env(&req, &envs)?;
    assert_eq!(resp["error"]["code"], -32602);
    assert_eq!(resp["error"]["data"]["kind"], "validation");

    let req = json!({"jsonrpc":"2.0","method":"tools/list","id":5});
    let resp = run_with_env(&req, &envs)?;
    assert_eq!(resp["error"]["code"], -32601);
    Ok(())
}

#[test]
fn content_length_framing_is_accepted() -> anyhow::Result<()> {
    let body = r#"{"jsonrpc":"2.0","method":"ping","id":6,"params":{"message":"hi"}}"#;
    let framed = format!("Content-Length: {}\r\n\r\n{}", body.len(), body);
    command(&[("DANBOORU_BASE_URL", "http://127.0.0.1:9")])?
        .write_stdin(framed)
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""message":"hi""#));
    Ok(())
}

#[test]
fn malformed_input_is_a_parse_error() -> anyhow::Result<()> {
    command(&[("DANBOORU_BASE_URL", "http://127.0.0.1:9")])?
        .write_stdin("{not json")
        .assert()
        .success()
        .stdout(predicate::str::contains("-32700"));
    Ok(())
}

#[test]
fn subscriptions_persist_in_the_state_file() -> anyhow::Result<()> {
    let server = MockServer::start();
    let init = server.mock(|when, then| {
        when.method(GET)
            .path("/posts.json")
            .query_param("tags", "a -rating:q -rating:e order:id_desc")
            .query_param("limit", "1");
        then.status(200).json_body(json!([{"id": 500}]));
    });
    let dir = tempfile::tempdir()?;
    let state = dir.path().join("state.json");
    let state = state.to_str().unwrap();
    let base_url = server.base_url();
    let envs = [
        ("DANBOORU_BASE_URL", base_url.as_str()),
        ("DANBOORU_STATE_PATH", state),
    ];

    let req = json!({
        "jsonrpc":"2.0","method":"subscriptions/subscribe","id":7,
        "params":{"group_id":"g1","platform":"qq","session_id":"s1","tag":"a"}
    });
    let resp = run_with_env(&req, &envs)?;
    init.assert();
    assert_eq!(resp["result"]["group"]["tags"]["a"]["last_post_id"], 500);
    assert_eq!(resp["result"]["messages"], json!([]));

    let req = json!({"jsonrpc":"2.0","method":"subscriptions/list","id":8,"params":{"group_id":"g1"}});
    let resp = run_with_env(&req, &envs)?;
    assert_eq!(resp["result"]["group"]["session_id"], "s1");
    assert_eq!(resp["result"]["group"]["tags"]["a"]["last_post_id"], 500);
    Ok(())
}

#[test]
fn popular_subscription_rejects_unknown_scale() -> anyhow::Result<()> {
    let req = json!({
        "jsonrpc":"2.0","method":"subscriptions/subscribe","id":9,
        "params":{"group_id":"g1","session_id":"s1","popular":true,"scale":"year"}
    });
    let resp = run_with_env(&req, &[("DANBOORU_BASE_URL", "http://127.0.0.1:9")])?;
    assert_eq!(resp["error"]["code"], -32602);
    Ok(())
}

#[test]
fn config_file_is_honored() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("config.json");
    std::fs::write(
        &path,
        serde_json::to_vec(&json!({"subscriptions": {"enabled": false}}))?,
    )?;
    let req = json!({
        "jsonrpc":"2.0","method":"subscriptions/subscribe","id":10,
        "params":{"group_id":"g1","tag":"a"}
    });
    let input = serde_json::to_string(&req)?;
    let assert = command(&[("DANBOORU_BASE_URL", "http://127.0.0.1:9")])?
        .arg("--config")
        .arg(&path)
        .write_stdin(input)
        .assert()
        .success();
    let resp: Value = serde_json::from_slice(&assert.get_output().stdout)?;
    assert_eq!(resp["error"]["code"], -32001);
    Ok(())
}

#[test]
fn version_flag_prints_version() -> anyhow::Result<()> {
    command(&[])?
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::starts_with("danbooru-bridge "));
    Ok(())
}
