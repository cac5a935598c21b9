//! Collection edit script based on the longest common subsequence.

use crate::codec::Value;

/// One step of an edit script. Indices refer to the collection as it is
/// after all previous steps have been applied.
#[derive(Debug, Clone, PartialEq)]
pub enum EditStep {
    Remove { idx: usize },
    Add { idx: usize, value: Value },
}

/// Compute the `remove` and `add` steps that turn `a` into `b`.
///
/// Removes are emitted first, from the highest index down, followed by the
/// adds in ascending order.
pub fn edit_script(a: &[Value], b: &[Value]) -> Vec<EditStep> {
    let mut m = a.len();
    let mut n = b.len();

    // Trim common prefix and suffix
    let mut s = 0;
    while s < m && s < n && a[s] == b[s] {
        s += 1;
    }
    if s == m && s == n {
        return Vec::new();
    }
    while s < m && s < n && a[m - 1] == b[n - 1] {
        m -= 1;
        n -= 1;
    }

    let aa = &a[s..m];
    let bb = &b[s..n];
    let m = aa.len();
    let n = bb.len();

    // c[i + w*j] holds the LCS length of aa[..i] and bb[..j]
    let w = m + 1;
    let mut c = vec![0usize; w * (n + 1)];
    for j in 0..n {
        for i in 0..m {
            c[(i + 1) + w * (j + 1)] = if aa[i] == bb[j] {
                c[i + w * j] + 1
            } else {
                c[(i + 1) + w * j].max(c[i + w * (j + 1)])
            };
        }
    }

    let mut steps = Vec::new();
    // (index into bb, position, removes so far)
    let mut adds: Vec<(usize, usize, usize)> = Vec::new();
    let mut idx = m + s;
    let mut i = m;
    let mut j = n;
    let mut r = 0;

    loop {
        if i > 0 && j > 0 && aa[i - 1] == bb[j - 1] {
            idx -= 1;
            i -= 1;
            j -= 1;
        } else if j > 0 && (i == 0 || c[i + w * (j - 1)] >= c[(i - 1) + w * j]) {
            adds.push((j - 1, idx, r));
            j -= 1;
        } else if i > 0 {
            idx -= 1;
            steps.push(EditStep::Remove { idx });
            r += 1;
            i -= 1;
        } else {
            break;
        }
    }

    let l = adds.len();
    for (k, &(bi, pos, removed)) in adds.iter().enumerate().rev() {
        // Earlier adds in this loop shift later positions by one each
        let idx = pos + removed + (l - 1 - k) - r;
        steps.push(EditStep::Add {
            idx,
            value: bb[bi].clone(),
        });
    }

    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::value::RawValue;

    fn values(s: &str) -> Vec<Value> {
        s.chars()
            .map(|c| Value::Primitive(RawValue::from_string(format!("\"{}\"", c)).unwrap()))
            .collect()
    }

    fn apply(mut a: Vec<Value>, steps: &[EditStep]) -> Vec<Value> {
        for step in steps {
            match step {
                EditStep::Remove { idx } => {
                    a.remove(*idx);
                }
                EditStep::Add { idx, value } => a.insert(*idx, value.clone()),
            }
        }
        a
    }

    #[test]
    fn test_remove_then_add() {
        let steps = edit_script(&values("abcd"), &values("acde"));
        assert_eq!(
            steps,
            vec![
                EditStep::Remove { idx: 1 },
                EditStep::Add { idx: 3, value: values("e").remove(0) },
            ]
        );
    }

    #[test]
    fn test_equal_collections() {
        assert!(edit_script(&values("abc"), &values("abc")).is_empty());
        assert!(edit_script(&[], &[]).is_empty());
    }

    #[test]
    fn test_applying_script_yields_target() {
        let cases = [
            ("", "abc"),
            ("abc", ""),
            ("abc", "cba"),
            ("abcdef", "axcyez"),
            ("aaaa", "aa"),
            ("ab", "ba"),
            ("abcabba", "cbabac"),
            ("xyz", "xaybzc"),
        ];
        for (a, b) in cases {
            let steps = edit_script(&values(a), &values(b));
            assert_eq!(apply(values(a), &steps), values(b), "{} -> {}", a, b);
        }
    }
}
