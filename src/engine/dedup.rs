use std::collections::HashSet;

use crate::config::DedupPolicy;
use crate::feed::{Candidate, ExtractError};
use crate::storage::Item;

/// Outcome of deduplicating one fetch.
#[derive(Debug, Default)]
pub struct Selection {
    /// Items not yet handled, oldest first (delivery order)
    pub unseen: Vec<Item>,
    /// Entries that could not be extracted; never marked handled
    pub skipped: Vec<ExtractError>,
    /// Candidates found in the handled set before scanning stopped
    pub already_handled: usize,
}

/// Pick the candidates that still need delivering.
///
/// `candidates` must be newest first. Every candidate whose id is in
/// `handled` is excluded regardless of policy; the policy only decides
/// whether scanning continues past the first handled one. Ids repeated
/// within one fetch are kept once (the newest occurrence).
pub fn select_unseen(
    candidates: Vec<Candidate>,
    handled: &HashSet<String>,
    policy: DedupPolicy,
) -> Selection {
    let mut selection = Selection::default();
    let mut picked: HashSet<String> = HashSet::new();

    for candidate in candidates {
        let item = match candidate {
            Ok(item) => item,
            Err(e) => {
                selection.skipped.push(e);
                continue;
            }
        };

        if handled.contains(&item.external_id) {
            selection.already_handled += 1;
            match policy {
                DedupPolicy::StopAtFirstSeen => break,
                DedupPolicy::FullScan => continue,
            }
        }

        if picked.insert(item.external_id.clone()) {
            selection.unseen.push(item);
        }
    }

    selection.unseen.reverse();
    selection
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn item(id: &str) -> Item {
        Item {
            external_id: id.to_string(),
            title: id.to_uppercase(),
            description: None,
            url: None,
            image_url: None,
            published_at: None,
        }
    }

    fn feed(ids: &[&str]) -> Vec<Candidate> {
        ids.iter().map(|id| Ok(item(id))).collect()
    }

    fn handled(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn ids(selection: &Selection) -> Vec<&str> {
        selection.unseen.iter().map(|i| i.external_id.as_str()).collect()
    }

    #[test]
    fn test_unseen_are_oldest_first() {
        let selection = select_unseen(
            feed(&["p3", "p2", "p1"]),
            &handled(&["p1"]),
            DedupPolicy::StopAtFirstSeen,
        );
        assert_eq!(ids(&selection), vec!["p2", "p3"]);
        assert_eq!(selection.already_handled, 1);
    }

    #[test]
    fn test_empty_state_takes_everything() {
        let selection = select_unseen(feed(&["c", "b", "a"]), &HashSet::new(), DedupPolicy::StopAtFirstSeen);
        assert_eq!(ids(&selection), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_stop_at_first_seen_ignores_older_gap() {
        // p1 sits below a handled item; append-only feeds never need it
        let selection = select_unseen(
            feed(&["p4", "p3", "p2", "p1"]),
            &handled(&["p3"]),
            DedupPolicy::StopAtFirstSeen,
        );
        assert_eq!(ids(&selection), vec!["p4"]);
    }

    #[test]
    fn test_full_scan_fills_gaps() {
        let selection = select_unseen(
            feed(&["p4", "p3", "p2", "p1"]),
            &handled(&["p3", "p1"]),
            DedupPolicy::FullScan,
        );
        assert_eq!(ids(&selection), vec!["p2", "p4"]);
        assert_eq!(selection.already_handled, 2);
    }

    #[test]
    fn test_extraction_failures_are_skipped_not_stopping() {
        let candidates = vec![
            Ok(item("p3")),
            Err(ExtractError {
                position: 1,
                reason: "no id".into(),
            }),
            Ok(item("p2")),
            Ok(item("p1")),
        ];
        let selection = select_unseen(candidates, &handled(&["p1"]), DedupPolicy::StopAtFirstSeen);
        assert_eq!(ids(&selection), vec!["p2", "p3"]);
        assert_eq!(selection.skipped.len(), 1);
    }

    #[test]
    fn test_duplicate_ids_in_one_fetch_kept_once() {
        let selection = select_unseen(feed(&["p2", "p2", "p1"]), &HashSet::new(), DedupPolicy::FullScan);
        assert_eq!(ids(&selection), vec!["p1", "p2"]);
    }

    proptest! {
        #[test]
        fn prop_never_selects_handled_ids(
            feed_ids in proptest::collection::vec(0u8..20, 0..15),
            handled_ids in proptest::collection::hash_set(0u8..20, 0..10),
            full_scan in any::<bool>(),
        ) {
            let candidates: Vec<Candidate> = feed_ids.iter().map(|n| Ok(item(&format!("p{n}")))).collect();
            let handled: HashSet<String> = handled_ids.iter().map(|n| format!("p{n}")).collect();
            let policy = if full_scan { DedupPolicy::FullScan } else { DedupPolicy::StopAtFirstSeen };

            let selection = select_unseen(candidates, &handled, policy);

            let mut seen = HashSet::new();
            for item in &selection.unseen {
                prop_assert!(!handled.contains(&item.external_id));
                prop_assert!(seen.insert(item.external_id.clone()));
            }
        }

        #[test]
        fn prop_selection_preserves_reverse_feed_order(
            count in 0usize..12,
        ) {
            let candidates: Vec<Candidate> = (0..count).rev().map(|n| Ok(item(&format!("p{n}")))).collect();
            let selection = select_unseen(candidates, &HashSet::new(), DedupPolicy::StopAtFirstSeen);
            let expected: Vec<String> = (0..count).map(|n| format!("p{n}")).collect();
            let actual: Vec<String> = selection.unseen.into_iter().map(|i| i.external_id).collect();
            prop_assert_eq!(actual, expected);
        }
    }
}
