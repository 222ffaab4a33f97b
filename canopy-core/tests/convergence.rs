use canopy_core::{CrdtDocument, YrsDocument};
use proptest::prelude::*;
use serde_json::json;

fn fragments_from(edits: &[(usize, usize, i64)]) -> Vec<Vec<u8>> {
    let mut writers: Vec<YrsDocument> = (0..3).map(|_| YrsDocument::new()).collect();
    let mut fragments = Vec::with_capacity(edits.len());
    for (writer, key, value) in edits {
        let doc = &mut writers[*writer];
        let mut current = doc.materialize();
        if let Some(object) = current.as_object_mut() {
            object.insert(format!("k{key}"), json!(value));
        }
        fragments.push(doc.write(&current).unwrap());
    }
    fragments
}

#[test]
fn duplicated_fragments_converge() {
    let fragments = fragments_from(&[(0, 0, 1), (1, 1, 2), (0, 0, 3)]);
    let baseline = YrsDocument::replay(fragments.iter().map(Vec::as_slice))
        .unwrap()
        .materialize();

    let mut doubled = fragments.clone();
    doubled.extend(fragments.iter().rev().cloned());
    let replayed = YrsDocument::replay(doubled.iter().map(Vec::as_slice)).unwrap();
    assert_eq!(replayed.materialize(), baseline);
}

const FIXED_EDITS: [(usize, usize, i64); 5] = [(0, 0, 1), (1, 0, 2), (2, 1, 3), (0, 2, 4), (1, 1, 5)];

fn reordered(fragments: &[Vec<u8>], order: &[usize]) -> Vec<Vec<u8>> {
    order.iter().map(|i| fragments[*i].clone()).collect()
}

/// Edits together with a permutation of their positions.
fn edits_and_order() -> impl Strategy<Value = (Vec<(usize, usize, i64)>, Vec<usize>)> {
    prop::collection::vec((0usize..3, 0usize..4, -100i64..100), 1..12).prop_flat_map(|edits| {
        let order = Just((0..edits.len()).collect::<Vec<_>>()).prop_shuffle();
        (Just(edits), order)
    })
}

proptest! {
    #[test]
    fn permutations_converge(order in Just((0..FIXED_EDITS.len()).collect::<Vec<_>>()).prop_shuffle()) {
        let fragments = fragments_from(&FIXED_EDITS);
        let baseline = YrsDocument::replay(fragments.iter().map(Vec::as_slice))
            .unwrap()
            .materialize();

        let shuffled = reordered(&fragments, &order);
        let replayed = YrsDocument::replay(shuffled.iter().map(Vec::as_slice)).unwrap();
        prop_assert_eq!(replayed.materialize(), baseline);
    }

    #[test]
    fn shuffled_fragments_converge_property((edits, order) in edits_and_order()) {
        let fragments = fragments_from(&edits);
        let baseline = YrsDocument::replay(fragments.iter().map(Vec::as_slice))
            .unwrap()
            .materialize();

        let shuffled = reordered(&fragments, &order);
        let replayed = YrsDocument::replay(shuffled.iter().map(Vec::as_slice)).unwrap();
        prop_assert_eq!(replayed.materialize(), baseline);
    }
}
