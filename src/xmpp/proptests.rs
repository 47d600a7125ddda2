//! Property-based tests for addresses and the session store
//!
//! Tests for:
//! - Jid: bare form drops only the resource, parsing is stable
//! - Store: committed tables survive a reopen unchanged

use super::store::{JsonFileStore, SessionStore};
use super::traits::Jid;
use proptest::prelude::*;
use serde_json::{json, Value};
use std::collections::BTreeMap;

fn part() -> impl Strategy<Value = String> {
    "[a-z0-9][a-z0-9._-]{0,15}"
}

proptest! {
    /// Property: bare() strips exactly the resource
    #[test]
    fn bare_strips_resource(local in part(), domain in part(), resource in part()) {
        let full = Jid::parse(&format!("{}@{}/{}", local, domain, resource)).unwrap();
        let bare = format!("{}@{}", local, domain);

        prop_assert_eq!(full.bare(), bare.as_str());
        prop_assert_eq!(full.resource(), Some(resource.as_str()));
        prop_assert_eq!(full.domain(), domain.as_str());
        prop_assert!(full.same_account(&Jid::parse(&bare).unwrap()));
    }

    /// Property: parsing a displayed Jid yields the same Jid
    #[test]
    fn display_parse_stable(local in part(), domain in part()) {
        let jid = Jid::parse(&format!("{}@{}", local, domain)).unwrap();
        let again = Jid::parse(&jid.to_string()).unwrap();
        prop_assert_eq!(jid, again);
    }

    /// Property: whatever was stored is what a fresh open loads
    #[test]
    fn store_survives_reopen(
        entries in prop::collection::btree_map("[a-z:@.0-9]{1,24}", any::<u32>(), 0..16),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("omemo.json");

        let store = JsonFileStore::open(&path).unwrap();
        for (key, value) in &entries {
            store.store(key, json!({ "counter": value })).unwrap();
        }

        let reopened = JsonFileStore::open(&path).unwrap();
        let loaded: BTreeMap<String, Value> = reopened.entries("").unwrap().into_iter().collect();
        prop_assert_eq!(loaded.len(), entries.len());
        for (key, value) in &entries {
            prop_assert_eq!(&loaded[key], &json!({ "counter": value }));
        }
    }
}
