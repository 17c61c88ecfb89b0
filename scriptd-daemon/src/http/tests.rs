use super::*;

fn uri(s: &str) -> Uri {
    s.parse().unwrap()
}

fn form_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        "application/x-www-form-urlencoded".parse().unwrap(),
    );
    headers
}

#[test]
fn test_collect_params_from_query() {
    let params = collect_params(
        &uri("/echo.sh?who=bob&logid=x1"),
        &HeaderMap::new(),
        &Bytes::new(),
    );
    assert_eq!(params["who"], "bob");
    assert_eq!(params["logid"], "x1");
}

#[test]
fn test_collect_params_merges_form_body() {
    let params = collect_params(
        &uri("/echo.sh?who=bob"),
        &form_headers(),
        &Bytes::from_static(b"count=3"),
    );
    assert_eq!(params["who"], "bob");
    assert_eq!(params["count"], "3");
}

#[test]
fn test_collect_params_joins_duplicates_with_comma() {
    let params = collect_params(
        &uri("/echo.sh?who=a&who=b"),
        &HeaderMap::new(),
        &Bytes::new(),
    );
    assert_eq!(params["who"], "a,b");
}

#[test]
fn test_body_ignored_without_form_content_type() {
    let params = collect_params(
        &uri("/echo.sh"),
        &HeaderMap::new(),
        &Bytes::from_static(b"who=bob"),
    );
    assert!(params.is_empty());
}

#[test]
fn test_urlencoded_values_decoded() {
    let params = collect_params(
        &uri("/echo.sh?who=hello%20world"),
        &HeaderMap::new(),
        &Bytes::new(),
    );
    assert_eq!(params["who"], "hello world");
}
