/// Similarity of `prediction` to the closest of `answers`, in `[0, 1]`.
///
/// Each pair scores `1 - lev(a, p) / max(|a|, |p|)` on lowercased, trimmed
/// strings; a best score below `threshold` counts as zero.
pub fn anls(prediction: &str, answers: &[String], threshold: f64) -> f64 {
    let prediction = normalize(prediction);
    let best = answers
        .iter()
        .map(|answer| similarity(&normalize(answer), &prediction))
        .fold(0.0f64, f64::max);
    if best < threshold {
        0.0
    } else {
        best
    }
}

fn normalize(text: &str) -> Vec<char> {
    text.trim().to_lowercase().chars().collect()
}

fn similarity(answer: &[char], prediction: &[char]) -> f64 {
    let longest = answer.len().max(prediction.len());
    if longest == 0 {
        return 1.0;
    }
    1.0 - levenshtein(answer, prediction) as f64 / longest as f64
}

fn levenshtein(a: &[char], b: &[char]) -> usize {
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn answers(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn edit_distance_basics() {
        let chars = |s: &str| s.chars().collect::<Vec<_>>();
        assert_eq!(levenshtein(&chars("kitten"), &chars("sitting")), 3);
        assert_eq!(levenshtein(&chars(""), &chars("abc")), 3);
        assert_eq!(levenshtein(&chars("same"), &chars("same")), 0);
    }

    #[test]
    fn best_answer_wins_and_case_is_ignored() {
        let score = anls("Blue Whale", &answers(&["orca", "blue whale"]), 0.5);
        assert_eq!(score, 1.0);
    }

    #[test]
    fn near_misses_keep_partial_credit() {
        // one substitution over six characters
        let score = anls("london", &answers(&["londen"]), 0.5);
        assert!((score - 5.0 / 6.0).abs() < 1e-12);
    }

    #[test]
    fn scores_below_the_threshold_are_zeroed() {
        assert_eq!(anls("cat", &answers(&["elephant"]), 0.5), 0.0);
        assert_eq!(anls("anything", &[], 0.5), 0.0);
    }
}
