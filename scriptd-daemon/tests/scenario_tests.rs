//! End-to-end scenarios driving real bash children through the dispatcher
//! and, for the wire-form checks, through the network transports.

use std::collections::HashMap;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use scriptd_daemon::server::{Server, VERSION};
use scriptd_daemon::{http, textproto};
use scriptd_protocol::{Request, Response, RunStatus, TransportKind};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn write_script(dir: &TempDir, name: &str, source: &str) {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(source.as_bytes()).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700)).unwrap();
}

fn server_with(scripts: &[(&str, &str)]) -> (TempDir, Arc<Server>) {
    let dir = TempDir::new().unwrap();
    for (name, source) in scripts {
        write_script(&dir, name, source);
    }
    let server = Arc::new(Server::new(dir.path()));
    server.load_scripts();
    (dir, server)
}

fn request(script_name: &str, params: &[(&str, &str)]) -> Request {
    Request {
        script_name: script_name.to_string(),
        params: params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>(),
        ts: chrono::Utc::now().timestamp(),
        remote_addr: "127.0.0.1:1".to_string(),
        transport: TransportKind::Json,
    }
}

async fn wait_finished(server: &Server, id: &str) -> RunStatus {
    for _ in 0..600 {
        let resp = server.handle(request("status", &[("id", id)])).await;
        let status = &resp.run_statii[0];
        if status.finished {
            return status.clone();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("run {id} never finished");
}

const ECHO_SH: &str = "\
# @desc greet
# @param who string `\"world\"` target
echo {{ who }}
";

#[tokio::test]
async fn s1_help_lists_annotations() {
    let (_dir, server) = server_with(&[(
        "hello",
        "# @desc greet\n# @param who string `\"world\"` target\necho {{ who }}\n",
    )]);

    let resp = server.handle(request("help", &[])).await;
    assert_eq!(resp.status_code, 200);

    let lines: Vec<&str> = resp.body.split('\n').collect();
    assert_eq!(lines[0], "");
    assert_eq!(lines[1], "hello");
    assert!(lines[2].parse::<i64>().is_ok(), "parse ts line: {}", lines[2]);
    assert_eq!(lines[3], "# @desc greet");
    assert_eq!(lines[4], "# @param who string `\"world\"` target");
    assert_eq!(lines[5], "");
}

#[tokio::test]
async fn s2_successful_run() {
    let (_dir, server) = server_with(&[("echo.sh", ECHO_SH)]);

    let resp = server.handle(request("echo.sh", &[])).await;
    assert_eq!(resp.status_code, 200);
    let initial = &resp.run_statii[0];
    assert_eq!(initial.script_name, "echo.sh");
    assert!(!initial.finished);

    let finished = wait_finished(&server, &initial.id).await;
    assert!(finished.finished);
    assert_eq!(finished.exit_code, 0);
}

#[tokio::test]
async fn s3_bad_param_is_rejected() {
    let (_dir, server) = server_with(&[(
        "count.sh",
        "# @param n int `1` how many\necho {{ n }}\n",
    )]);

    let resp = server.handle(request("count.sh", &[("n", "[]")])).await;
    assert_eq!(resp.status_code, 400);
    assert!(resp.error_str.contains("Unable to parse"));
    assert!(resp.run_statii.is_empty());
}

#[tokio::test]
async fn s4_timeout_kills_long_run() {
    let (_dir, server) = server_with(&[(
        "hang.sh",
        "echo 2 >&$_timeout\nsleep 60\n",
    )]);

    let started = Instant::now();
    let resp = server.handle(request("hang.sh", &[])).await;
    let finished = wait_finished(&server, &resp.run_statii[0].id).await;

    assert_ne!(finished.exit_code, 0);
    assert!(
        started.elapsed() < Duration::from_secs(30),
        "run should die around the 2s timeout"
    );
}

#[tokio::test]
async fn s5_append_vs_overwrite() {
    let (_dir, server) = server_with(&[(
        "outputs.sh",
        "# @output a1 a\n# @output a2 w\n\
         echo x >&$a1\necho y >&$a1\necho z >&$a2\necho w >&$a2\n",
    )]);

    let resp = server.handle(request("outputs.sh", &[])).await;
    let finished = wait_finished(&server, &resp.run_statii[0].id).await;

    assert_eq!(finished.outputs["a1"], "x\ny\n");
    assert_eq!(finished.outputs["a2"], "w");
}

#[tokio::test]
async fn s6_clear_resets_output() {
    let (_dir, server) = server_with(&[(
        "clear.sh",
        "# @output a1 a\n\
         echo x >&$a1\nsleep 0.3\necho a1 >&$_clear\nsleep 0.3\necho y >&$a1\n",
    )]);

    let resp = server.handle(request("clear.sh", &[])).await;
    let finished = wait_finished(&server, &resp.run_statii[0].id).await;
    assert_eq!(finished.outputs["a1"], "y\n");
}

#[tokio::test]
async fn snapshots_observe_prefixes_of_append_stream() {
    let (_dir, server) = server_with(&[(
        "stream.sh",
        "# @output a1 a\nfor i in $(seq 1 40); do echo $i >&$a1; sleep 0.01; done\n",
    )]);

    let resp = server.handle(request("stream.sh", &[])).await;
    let id = resp.run_statii[0].id.clone();

    let mut observed = Vec::new();
    loop {
        let resp = server.handle(request("status", &[("id", &id)])).await;
        let status = resp.run_statii[0].clone();
        let done = status.finished;
        observed.push(status);
        if done {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let final_value = &observed.last().unwrap().outputs["a1"];
    for status in &observed {
        assert!(
            final_value.starts_with(&status.outputs["a1"]),
            "snapshot must be a point-in-time prefix"
        );
    }
}

#[tokio::test]
async fn textproto_wire_round_trip() {
    let (_dir, server) = server_with(&[("echo.sh", ECHO_SH)]);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(textproto::serve(listener, server.clone()));

    // version built-in
    let mut conn = TcpStream::connect(addr).await.unwrap();
    conn.write_all(b"version\n").await.unwrap();
    let mut reply = String::new();
    conn.read_to_string(&mut reply).await.unwrap();
    assert_eq!(reply, format!("OK 200\r\n{VERSION}\r\n"));

    // script dispatch returns the snapshot text form
    let mut conn = TcpStream::connect(addr).await.unwrap();
    conn.write_all(b"echo.sh -who=bob -logid=x1\n").await.unwrap();
    let mut reply = String::new();
    conn.read_to_string(&mut reply).await.unwrap();
    assert!(reply.starts_with("OK 200\r\n"));
    assert!(reply.contains(" name echo.sh\n"));
    assert!(reply.contains(" param who 'bob'\n"));

    // unknown command
    let mut conn = TcpStream::connect(addr).await.unwrap();
    conn.write_all(b"nope\n").await.unwrap();
    let mut reply = String::new();
    conn.read_to_string(&mut reply).await.unwrap();
    assert_eq!(reply, "ERR 404\r\nScript or command does not exist\r\n");
}

#[tokio::test]
async fn json_wire_round_trip() {
    let (_dir, server) = server_with(&[("echo.sh", ECHO_SH)]);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(http::serve(listener, server.clone()));

    let raw = http_get(addr, "/version").await;
    assert!(raw.starts_with("HTTP/1.1 200"));
    assert!(raw.contains("application/json"));

    let body = raw.split("\r\n\r\n").nth(1).unwrap();
    let resp: serde_json::Value = serde_json::from_str(body).unwrap();
    assert_eq!(resp["status_code"], 200);
    assert_eq!(resp["body"], VERSION);
    assert!(resp.get("error").is_none());

    let raw = http_get(addr, "/echo.sh?who=bob").await;
    assert!(raw.starts_with("HTTP/1.1 200"));
    let body = raw.split("\r\n\r\n").nth(1).unwrap();
    let resp: serde_json::Value = serde_json::from_str(body).unwrap();
    assert_eq!(resp["run_statii"][0]["script_name"], "echo.sh");
    assert_eq!(resp["run_statii"][0]["params"]["who"], "'bob'");

    let raw = http_get(addr, "/missing").await;
    assert!(raw.starts_with("HTTP/1.1 404"));
}

async fn http_get(addr: std::net::SocketAddr, path: &str) -> String {
    let mut conn = TcpStream::connect(addr).await.unwrap();
    conn.write_all(
        format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n").as_bytes(),
    )
    .await
    .unwrap();
    let mut reply = String::new();
    conn.read_to_string(&mut reply).await.unwrap();
    reply
}

#[tokio::test]
async fn view_returns_rendered_source_over_the_wire() {
    let (_dir, server) = server_with(&[("echo.sh", ECHO_SH)]);

    let resp = server.handle(request("echo.sh", &[("who", "bob")])).await;
    let id = resp.run_statii[0].id.clone();

    let resp: Response = server.handle(request("view", &[("id", &id)])).await;
    assert!(resp.body.contains("echo 'bob'"));
    wait_finished(&server, &id).await;
}

#[tokio::test]
async fn reload_picks_up_new_scripts() {
    let (dir, server) = server_with(&[("first.sh", ECHO_SH)]);

    write_script(&dir, "second.sh", ECHO_SH);
    server.load_scripts();

    let resp = server.handle(request("second.sh", &[])).await;
    assert_eq!(resp.status_code, 200);
    wait_finished(&server, &resp.run_statii[0].id).await;
}
