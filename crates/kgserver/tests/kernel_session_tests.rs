//
// kernel_session_tests.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
// Licensed under the Elastic License 2.0. See LICENSE.txt for license information.
//

//! Tests for signing sessions and message identifiers

use std::collections::HashSet;

use kgserver::kernel_session::{make_message_id, KernelSession, PROTOCOL_VERSION};
use kgshared::jupyter_message::{JupyterChannel, JupyterMessageHeader};

#[test]
fn test_message_ids_are_unique() {
    let ids: HashSet<String> = (0..10_000).map(|_| make_message_id()).collect();
    assert_eq!(ids.len(), 10_000);
}

#[test]
fn test_message_ids_are_uuid_shaped() {
    let id = make_message_id();
    assert!(uuid::Uuid::parse_str(&id).is_ok(), "{} is not a UUID", id);
}

#[test]
fn test_generated_keys_are_distinct_hex() {
    let keys: HashSet<String> = (0..100)
        .map(|_| KernelSession::generate().unwrap().key)
        .collect();
    assert_eq!(keys.len(), 100);
    for key in &keys {
        assert_eq!(key.len(), 32);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }
}

#[test]
fn test_session_ids_are_distinct() {
    let a = KernelSession::generate().unwrap();
    let b = KernelSession::generate().unwrap();
    assert_ne!(a.session_id, b.session_id);
    assert_eq!(a.signature_scheme, "hmac-sha256");
}

#[test]
fn test_headers_carry_session_identity() {
    let session = KernelSession::generate().unwrap();
    let header = session.make_header("execute_request");

    assert_eq!(header.msg_type, "execute_request");
    assert_eq!(header.session, session.session_id);
    assert_eq!(header.username, session.username);
    assert_eq!(header.version, PROTOCOL_VERSION);
    assert!(chrono::DateTime::parse_from_rfc3339(&header.date).is_ok());
}

#[test]
fn test_request_has_empty_content() {
    let session = KernelSession::generate().unwrap();
    let request = session.make_request("kernel_info_request", JupyterChannel::Control);

    assert_eq!(request.channel, JupyterChannel::Control);
    assert_eq!(request.parent_header, None);
    assert_eq!(request.content, serde_json::json!({}));
    assert_eq!(request.metadata, serde_json::json!({}));
    assert!(request.buffers.is_empty());
}

#[test]
fn test_complete_header_only_fills_blanks() {
    let session = KernelSession::generate().unwrap();

    let mut sparse = JupyterMessageHeader {
        msg_type: String::from("execute_request"),
        ..Default::default()
    };
    session.complete_header(&mut sparse);
    assert!(!sparse.msg_id.is_empty());
    assert_eq!(sparse.session, session.session_id);
    assert_eq!(sparse.version, PROTOCOL_VERSION);
    assert!(!sparse.date.is_empty());

    let mut full = JupyterMessageHeader {
        msg_id: String::from("client-id"),
        msg_type: String::from("execute_request"),
        username: String::from("someone"),
        session: String::from("client-session"),
        date: String::from("2025-01-01T00:00:00.000Z"),
        version: String::from("5.0"),
    };
    let before = full.clone();
    session.complete_header(&mut full);
    assert_eq!(full, before);
}
