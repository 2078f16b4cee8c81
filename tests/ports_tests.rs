use domscan_rs::ports::parse_port_list;

#[test]
fn parse_nmap_style_list() {
    let ports = parse_port_list(" 22,80, 443 ,8000-8002,8001").expect("parse ok");
    // Dedup, first appearance wins
    assert_eq!(ports, vec![22, 80, 443, 8000, 8001, 8002]);
}

#[test]
fn invalid_port_rejected() {
    assert!(parse_port_list("0").is_err());
    assert!(parse_port_list("65536").is_err());
    assert!(parse_port_list("22,abc").is_err());
}

#[test]
fn error_names_offending_item() {
    let err = parse_port_list("22,80-70").unwrap_err();
    assert!(format!("{err:#}").contains("item 2"), "{err:#}");
}
