use std::path::PathBuf;

use rentwatch_adapters::parse_search_response;

fn fixture(name: &str) -> String {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/idealista")
        .join(name);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}

#[test]
fn recorded_search_page_parses_into_flat_records() {
    let page = parse_search_response(&fixture("search_page.json")).expect("parse fixture");

    assert_eq!(page.total, 103);
    assert_eq!(page.total_pages, 3);
    assert_eq!(page.actual_page, 1);
    assert_eq!(page.records.len(), 3);

    let first = &page.records[0];
    let key = first.dedup_key();
    assert_eq!(key.property_code, "103842650");
    assert_eq!(key.price, "1500");
    assert_eq!(key.size, "70");
    assert_eq!(first.text("hasLift"), "True");
    assert_eq!(first.text("detailedType"), r#"{"typology":"flat"}"#);
    assert!(first.text("filters").contains("amueblados en Madrid"));
}

#[test]
fn records_on_one_page_may_have_different_field_sets() {
    let page = parse_search_response(&fixture("search_page.json")).expect("parse fixture");
    assert!(page.records[0].get("thumbnail").is_some());
    assert!(page.records[1].get("thumbnail").is_none());
}
