/// Ratcliff/Obershelp string similarity.
///
/// `ratio` is 2·M / T where T is the combined length of both strings and M
/// the number of characters in matching blocks. Blocks are found by taking
/// the longest common substring, then recursing on the pieces to its left
/// and right. Among equally long substrings the one starting earliest in `a`
/// wins, then the one starting earliest in `b`.

pub fn ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    let matched = matching_chars(&a, &b);
    2.0 * matched as f64 / total as f64
}

fn matching_chars(a: &[char], b: &[char]) -> usize {
    let (i, j, len) = longest_match(a, b);
    if len == 0 {
        return 0;
    }
    len + matching_chars(&a[..i], &b[..j]) + matching_chars(&a[i + len..], &b[j + len..])
}

/// Longest common substring as (start in a, start in b, length).
fn longest_match(a: &[char], b: &[char]) -> (usize, usize, usize) {
    let mut best = (0, 0, 0);
    // run[j + 1] = length of the match ending at a[i], b[j]
    let mut prev = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        let mut run = vec![0usize; b.len() + 1];
        for (j, cb) in b.iter().enumerate() {
            if ca == cb {
                let k = prev[j] + 1;
                run[j + 1] = k;
                // strictly greater keeps the earliest block on ties
                if k > best.2 {
                    best = (i + 1 - k, j + 1 - k, k);
                }
            }
        }
        prev = run;
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(x: f64, y: f64) -> bool {
        (x - y).abs() < 1e-9
    }

    #[test]
    fn test_identical_and_disjoint() {
        assert!(close(ratio("select", "select"), 1.0));
        assert!(close(ratio("abc", "xyz"), 0.0));
        assert!(close(ratio("", ""), 1.0));
        assert!(close(ratio("abc", ""), 0.0));
    }

    #[test]
    fn test_known_values() {
        // ":to" + "gle" match → 2·6 / 14
        assert!(close(ratio(":toogle", ":toggle"), 12.0 / 14.0));
        // ":sel" + "ct" match → 2·6 / 13
        assert!(close(ratio(":selct", ":select"), 12.0 / 13.0));
        // classic difflib example
        assert!(close(ratio("abcd", "bcde"), 0.75));
    }

    #[test]
    fn test_recursion_uses_both_sides() {
        // "b" left of "cd" and "f" right of it are both counted
        assert!(close(ratio("abcdef", "bcdf"), 2.0 * 4.0 / 10.0));
    }

    #[test]
    fn test_longest_match_prefers_earliest() {
        let a: Vec<char> = "abxab".chars().collect();
        let b: Vec<char> = "ab".chars().collect();
        assert_eq!(longest_match(&a, &b), (0, 0, 2));
    }
}
