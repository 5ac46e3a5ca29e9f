//! Property tests for the merge engine
//!
//! Replicas must end up identical whatever order updates arrive in, and
//! replaying an update must change nothing.

use inspection_sync::domain::entities::{
    ChatMessage, DocumentFragment, FieldError, SharedDocument, WorkMetadata,
};
use inspection_sync::{MergeEngine, NodeId};
use proptest::collection::{btree_map, vec};
use proptest::option;
use proptest::prelude::*;
use serde_json::{json, Map};

fn work_strategy() -> impl Strategy<Value = WorkMetadata> {
    (0i64..50, 0u32..5).prop_map(|(timestamp, km)| {
        let mut fields = Map::new();
        fields.insert("km".to_string(), json!(km));
        WorkMetadata {
            last_modified_at: timestamp,
            last_modified_by: None,
            fields,
        }
    })
}

fn field_error_strategy() -> impl Strategy<Value = FieldError> {
    (0i64..50, 0u8..3).prop_map(|(timestamp, label)| FieldError {
        timestamp,
        label: Some(format!("label-{}", label)),
        ..Default::default()
    })
}

// Messages sharing an id are identical, as they are when one author posts them.
fn message_strategy() -> impl Strategy<Value = ChatMessage> {
    (0i64..20).prop_map(|n| ChatMessage {
        id: format!("m{:02}", n),
        timestamp: 1_000 + n / 2,
        text: Some(format!("message {}", n)),
        ..Default::default()
    })
}

fn fragment_strategy() -> impl Strategy<Value = DocumentFragment> {
    (
        option::of(work_strategy()),
        option::of(btree_map("[a-d]", field_error_strategy(), 0..4)),
        option::of(vec(message_strategy(), 0..6)),
        option::of(btree_map("[a-d]", any::<bool>(), 0..4)),
    )
        .prop_map(|(work, errors, mensagens, completion_states)| DocumentFragment {
            work,
            errors,
            mensagens,
            completion_states,
            ..Default::default()
        })
}

fn merged(fragments: &[&DocumentFragment]) -> SharedDocument {
    let mut doc = SharedDocument::new();
    let from = NodeId::new("oae-peer");
    for fragment in fragments {
        MergeEngine::merge_document(&mut doc, fragment, &from);
    }
    doc
}

proptest! {
    #[test]
    fn merge_order_does_not_matter(
        first in fragment_strategy(),
        second in fragment_strategy(),
        third in fragment_strategy(),
    ) {
        let forward = merged(&[&first, &second, &third]);
        let backward = merged(&[&third, &second, &first]);
        let shuffled = merged(&[&second, &first, &third]);

        prop_assert!(forward.same_content(&backward));
        prop_assert!(forward.same_content(&shuffled));
    }

    #[test]
    fn merge_is_idempotent(fragment in fragment_strategy()) {
        let mut doc = merged(&[&fragment]);
        let before = doc.clone();

        let report = MergeEngine::merge_document(&mut doc, &fragment, &NodeId::new("oae-other"));

        prop_assert!(!report.changed());
        prop_assert_eq!(doc, before);
    }

    #[test]
    fn merged_lists_are_ordered_and_unique(
        fragments in vec(fragment_strategy(), 1..5),
    ) {
        let refs: Vec<&DocumentFragment> = fragments.iter().collect();
        let doc = merged(&refs);

        let keys: Vec<(i64, &str)> = doc
            .mensagens
            .iter()
            .map(|m| (m.timestamp, m.id.as_str()))
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        sorted.dedup_by(|a, b| a.1 == b.1);
        prop_assert_eq!(keys, sorted);
    }

    #[test]
    fn newer_work_wins_either_way(
        older in work_strategy(),
        newer in work_strategy(),
        gap in 1i64..10,
    ) {
        let newer = WorkMetadata {
            last_modified_at: older.last_modified_at + gap,
            ..newer
        };
        let a = DocumentFragment { work: Some(older.clone()), ..Default::default() };
        let b = DocumentFragment { work: Some(newer.clone()), ..Default::default() };

        prop_assert_eq!(&merged(&[&a, &b]).work, &newer);
        prop_assert_eq!(&merged(&[&b, &a]).work, &newer);
    }

    #[test]
    fn completion_never_reverts(states in btree_map("[a-d]", any::<bool>(), 1..4)) {
        let done: std::collections::BTreeMap<String, bool> =
            states.keys().map(|k| (k.clone(), true)).collect();
        let completed = DocumentFragment { completion_states: Some(done), ..Default::default() };
        let later = DocumentFragment { completion_states: Some(states), ..Default::default() };

        let doc = merged(&[&completed, &later]);
        prop_assert!(doc.completion_states.values().all(|v| *v));
    }
}
