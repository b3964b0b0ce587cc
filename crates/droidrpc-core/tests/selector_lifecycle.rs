//! Selector state machine tests.
//!
//! A selector accumulates predicates, searches, and is cleared after every
//! search so the next search only sees predicates added since.

mod common;

use std::time::Duration;

use droidrpc_core::binding::entry;
use droidrpc_core::element::Rect;
use droidrpc_core::mock_engine::MockEngine;
use droidrpc_core::node::QueryKind;

use common::{call_names, connected_device};

#[tokio::test]
async fn test_empty_match_returns_none() {
    let (_engine, device) = connected_device(MockEngine::device()).await;
    let mut selector = device.selector().unwrap();
    selector
        .add_class_query("android.widget.Button")
        .unwrap()
        .add_enabled_query(false)
        .unwrap();
    assert!(selector
        .find_one(Duration::from_millis(200))
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_predicates_do_not_leak_across_searches() {
    let (engine, device) = connected_device(MockEngine::device()).await;
    let mut selector = device.selector().unwrap();

    selector.add_text_query("first").unwrap();
    selector.add_class_query("android.widget.EditText").unwrap();
    selector.find_one(Duration::from_millis(100)).unwrap();

    selector.add_text_query("second").unwrap();
    assert_eq!(
        selector.queries(),
        &[(QueryKind::TextContains, "second".to_string())]
    );
    selector.find_one(Duration::from_millis(100)).unwrap();

    // Between the first clear and the second search only one predicate is added.
    let names = call_names(&engine);
    let first_clear = names
        .iter()
        .position(|n| n == entry::CLEAR_SELECTOR)
        .unwrap();
    let second_find = names
        .iter()
        .rposition(|n| n == entry::FIND_NODES)
        .unwrap();
    let between: Vec<&String> = names[first_clear + 1..second_find]
        .iter()
        .filter(|n| n.starts_with("addQuery_"))
        .collect();
    assert_eq!(between, vec![entry::ADD_QUERY_TEXT]);

    assert_eq!(
        engine.strings_for(entry::ADD_QUERY_TEXT),
        vec!["first", "second"]
    );
    assert_eq!(engine.call_count(entry::CLEAR_SELECTOR), 2);
}

#[tokio::test]
async fn test_explicit_clear_resets_queries() {
    let (engine, device) = connected_device(MockEngine::device()).await;
    let mut selector = device.selector().unwrap();
    selector.add_text_query("x").unwrap();
    selector.clear().unwrap();
    assert!(selector.queries().is_empty());
    assert_eq!(
        engine.calls_to(entry::CLEAR_SELECTOR)[0].args,
        vec![MockEngine::SELECTOR_HANDLE]
    );
}

#[tokio::test]
async fn test_found_node_click_and_center() {
    let engine = MockEngine::device()
        .with_match()
        .with_bounds(Rect::new(40, 1180, 680, 1240));
    let (engine, device) = connected_device(engine).await;

    let mut selector = device.selector().unwrap();
    selector.add_text_query("More").unwrap();
    let node = selector.find_one(Duration::from_secs(2)).unwrap().unwrap();

    let bounds = node.bounds().unwrap();
    assert_eq!(bounds.center(), (360, 1210));
    node.click().unwrap();
    assert_eq!(engine.call_count(entry::CLICK_NODE), 1);
    // The selector was still cleared after the successful search.
    assert_eq!(engine.call_count(entry::CLEAR_SELECTOR), 1);
}

#[tokio::test]
async fn test_rejected_predicate_is_not_recorded() {
    let (_engine, device) =
        connected_device(MockEngine::device().with(entry::ADD_QUERY_ENABLED, 0)).await;
    let mut selector = device.selector().unwrap();
    selector.add_text_query("ok").unwrap();
    assert!(selector.add_enabled_query(true).is_err());
    assert_eq!(selector.queries().len(), 1);
}
