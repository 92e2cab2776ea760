use std::collections::HashMap;

use super::postprocess::ParsedItem;

const F1_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BagScore {
    pub f1: f64,
    pub recall: f64,
    pub precision: f64,
}

/// Order-insensitive multiset match of predicted against ground-truth items.
///
/// Items are keyed by `text`, or by `(text, label)` when `strict`. Precision
/// and recall divide by the raw list lengths, duplicates included, and are
/// zero whenever nothing matched.
pub fn bag_of_items(
    ground_truth: &[ParsedItem],
    prediction: &[ParsedItem],
    strict: bool,
) -> BagScore {
    let expected = count(ground_truth, strict);
    let predicted = count(prediction, strict);

    let true_positives: usize = expected
        .iter()
        .map(|(key, &wanted)| wanted.min(predicted.get(key).copied().unwrap_or(0)))
        .sum();

    if true_positives == 0 {
        return BagScore::default();
    }

    let recall = true_positives as f64 / ground_truth.len() as f64;
    let precision = true_positives as f64 / prediction.len() as f64;
    let f1 = 2.0 * precision * recall / (precision + recall + F1_EPSILON);
    BagScore {
        f1,
        recall,
        precision,
    }
}

fn count(items: &[ParsedItem], strict: bool) -> HashMap<(&str, &str), usize> {
    let mut counts = HashMap::new();
    for item in items {
        let label = if strict { item.label.as_str() } else { "" };
        *counts.entry((item.text.as_str(), label)).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(texts: &[&str]) -> Vec<ParsedItem> {
        texts.iter().map(|text| ParsedItem::new(*text, "x")).collect()
    }

    #[test]
    fn duplicates_count_against_the_raw_lengths() {
        let score = bag_of_items(&items(&["A", "A", "B"]), &items(&["A", "C"]), false);
        assert!((score.precision - 0.5).abs() < 1e-12);
        assert!((score.recall - 1.0 / 3.0).abs() < 1e-12);
        assert!((score.f1 - 0.4).abs() < 1e-6);
    }

    #[test]
    fn identical_lists_score_one() {
        let list = items(&["a", "b", "b"]);
        let score = bag_of_items(&list, &list, true);
        assert!((score.f1 - 1.0).abs() < 1e-6);
        assert_eq!(score.recall, 1.0);
        assert_eq!(score.precision, 1.0);
    }

    #[test]
    fn disjoint_and_empty_lists_score_zero() {
        let disjoint = bag_of_items(&items(&["a"]), &items(&["b"]), false);
        assert_eq!(disjoint, BagScore::default());
        assert_eq!(bag_of_items(&[], &[], false), BagScore::default());
        assert_eq!(bag_of_items(&items(&["a"]), &[], false), BagScore::default());
    }

    #[test]
    fn strict_mode_requires_matching_labels() {
        let truth = vec![ParsedItem::new("Name", "question")];
        let prediction = vec![ParsedItem::new("Name", "answer")];
        assert_eq!(bag_of_items(&truth, &prediction, true).f1, 0.0);
        assert!(bag_of_items(&truth, &prediction, false).f1 > 0.99);
    }
}
