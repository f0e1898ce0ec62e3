//! Deterministic shard-result synthesis.
//!
//! Shard results arrive in completion order; the synthesizer re-imposes
//! input order (stable sort by index, ties broken by id) and concatenates
//! one block per shard: `[Shard <id>]` followed by the output, or
//! `[Shard <id> Error]` followed by the error text.

use crate::eai::scheduler::TaskResult;

/// Concatenate shard results into the final answer text.
pub fn synthesize(results: &[TaskResult]) -> String {
    let mut ordered: Vec<&TaskResult> = results.iter().collect();
    ordered.sort_by(|a, b| a.index.cmp(&b.index).then_with(|| a.id.cmp(&b.id)));

    let mut out = String::new();
    for result in ordered {
        match &result.error {
            Some(err) => out.push_str(&format!("[Shard {} Error] {}\n", result.id, err)),
            None => out.push_str(&format!("[Shard {}]\n{}\n", result.id, result.output)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(id: &str, index: usize, output: &str) -> TaskResult {
        TaskResult {
            id: id.to_string(),
            index,
            output: output.to_string(),
            error: None,
        }
    }

    #[test]
    fn out_of_order_results_are_reordered() {
        let results = vec![result("2", 1, "two"), result("1", 0, "one")];
        let text = synthesize(&results);
        let first = text.find("[Shard 1]").unwrap();
        let second = text.find("[Shard 2]").unwrap();
        assert!(first < second);
        assert!(text.contains("one"));
        assert!(text.contains("two"));
    }

    #[test]
    fn errors_use_the_error_marker() {
        let mut failed = result("3", 2, "");
        failed.error = Some("boom".to_string());
        let text = synthesize(&[result("1", 0, "ok"), failed]);
        assert!(text.contains("[Shard 1]\nok\n"));
        assert!(text.contains("[Shard 3 Error] boom\n"));
    }

    #[test]
    fn marker_count_matches_shard_count() {
        let results: Vec<TaskResult> = (0..4)
            .map(|i| result(&(i + 1).to_string(), i, "x"))
            .collect();
        let text = synthesize(&results);
        assert_eq!(text.matches("[Shard ").count(), 4);
    }
}
