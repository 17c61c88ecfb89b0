use super::*;

use scriptd_protocol::{RequestError, RunStatus};
use std::collections::BTreeMap;

fn peer() -> SocketAddr {
    "127.0.0.1:5000".parse().unwrap()
}

#[test]
fn test_parse_request_line() {
    let req = parse_request_line("echo.sh -who=bob --logid=x1 count=3\n", peer()).unwrap();
    assert_eq!(req.script_name, "echo.sh");
    assert_eq!(req.params["who"], "bob");
    assert_eq!(req.params["logid"], "x1");
    assert_eq!(req.params["count"], "3");
    assert_eq!(req.transport, TransportKind::Textproto);
}

#[test]
fn test_parse_request_line_blank() {
    assert!(parse_request_line("\n", peer()).is_none());
    assert!(parse_request_line("   \n", peer()).is_none());
}

#[test]
fn test_parse_request_line_ignores_malformed_tokens() {
    let req = parse_request_line("status noequals -id=abc\n", peer()).unwrap();
    assert_eq!(req.script_name, "status");
    assert_eq!(req.params.len(), 1);
    assert_eq!(req.params["id"], "abc");
}

#[test]
fn test_render_ok_with_body() {
    let resp = Response::with_body(200, "1.6.0");
    assert_eq!(render_response(&resp), "OK 200\r\n1.6.0\r\n");
}

#[test]
fn test_render_err_uses_error_string() {
    let resp = Response::err(404, RequestError::UnknownScript);
    assert_eq!(
        render_response(&resp),
        "ERR 404\r\nScript or command does not exist\r\n"
    );
}

#[test]
fn test_render_statii_concatenated() {
    let status = RunStatus {
        script_name: "echo.sh".to_string(),
        id: "r1".to_string(),
        script_ts: 1,
        params: BTreeMap::new(),
        outputs: BTreeMap::new(),
        timeout_set_ts: 2,
        start_ts: 3,
        finish_ts: 4,
        finished: true,
        exit_code: 0,
    };
    let resp = Response::with_statii(200, vec![status]);
    let rendered = render_response(&resp);
    assert!(rendered.starts_with("OK 200\r\n"));
    assert!(rendered.contains("r1 name echo.sh\n"));
    assert!(rendered.contains("r1 exit_code 0\n"));
    assert!(rendered.ends_with("\r\n"));
}

#[test]
fn test_error_status_code_alone_renders_err() {
    let resp = Response::with_body(500, "boom");
    assert!(render_response(&resp).starts_with("ERR 500\r\n"));
}
