use super::*;

fn sample_status() -> RunStatus {
    RunStatus {
        script_name: "echo.sh".to_string(),
        id: "abc-123".to_string(),
        script_ts: 1700000000,
        params: BTreeMap::from([("who".to_string(), "'world'".to_string())]),
        outputs: BTreeMap::from([("a1".to_string(), "x\ny\n".to_string())]),
        timeout_set_ts: 1700000001,
        start_ts: 1700000002,
        finish_ts: 1700000003,
        finished: true,
        exit_code: 0,
    }
}

#[test]
fn test_status_text_form() {
    let text = sample_status().to_string();
    let expected = "\
abc-123 name echo.sh
abc-123 id abc-123
abc-123 param who 'world'
abc-123 output a1 x
y

abc-123 timeout_set_ts 1700000001
abc-123 start_ts 1700000002
abc-123 finish_ts 1700000003
abc-123 finished true
abc-123 exit_code 0
";
    assert_eq!(text, expected);
}

#[test]
fn test_response_json_omits_structured_error() {
    let resp = Response::err(404, RequestError::UnknownScript);
    let json = serde_json::to_value(&resp).unwrap();
    assert!(json.get("error").is_none());
    assert_eq!(json["error_str"], "Script or command does not exist");
    assert_eq!(json["status_code"], 404);
}

#[test]
fn test_response_is_err() {
    assert!(Response::err(400, RequestError::RunNotFound("x".into())).is_err());
    assert!(Response::with_body(500, "boom").is_err());
    assert!(!Response::with_body(200, "ok").is_err());
    assert!(!Response::with_statii(200, vec![sample_status()]).is_err());
}

#[test]
fn test_param_parse_error_message() {
    let err = RequestError::ParamParse {
        name: "who".to_string(),
        ty: "string".to_string(),
        value: "[]".to_string(),
    };
    assert_eq!(err.to_string(), "Unable to parse `[]` as who (string)");
}

#[test]
fn test_request_param_lookup() {
    let req = Request {
        script_name: "status".to_string(),
        params: HashMap::from([("id".to_string(), "abc".to_string())]),
        ts: 0,
        remote_addr: "127.0.0.1:9".to_string(),
        transport: TransportKind::Textproto,
    };
    assert_eq!(req.param("id"), "abc");
    assert_eq!(req.param("missing"), "");
}
