use super::*;

#[test]
fn test_normalize_addr_port_shorthand() {
    assert_eq!(normalize_addr(":4488"), "0.0.0.0:4488");
}

#[test]
fn test_normalize_addr_full_form_untouched() {
    assert_eq!(normalize_addr("127.0.0.1:4488"), "127.0.0.1:4488");
}
