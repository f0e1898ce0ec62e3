use eai::eai::splitter::{
    desired_shard_count, fallback_subtasks, render_retry_prompt, render_shard_prompt, split_task,
};

#[test]
fn bullet_list_splits_into_ordered_shards() {
    let shards = split_task("- build package\n- run tests\n- summarize results", 5);
    assert_eq!(
        shards,
        vec!["build package", "run tests", "summarize results"]
    );
}

#[test]
fn connector_split_produces_two_shards() {
    let shards = split_task("Compile the report and then publish it", 2);
    assert_eq!(shards, vec!["Compile the report", "publish it"]);
}

#[test]
fn anaphoric_conditional_stays_whole() {
    let shards = split_task("Run compile and test; if it fails, fix the first failure", 2);
    assert_eq!(shards.len(), 1);
    assert_eq!(
        shards[0],
        "Run compile and test; if it fails, fix the first failure"
    );
}

#[test]
fn every_shard_has_at_least_two_words_and_is_unique() {
    let input = "- fix login\n- fix login\n- x\n- update the docs\n- run the full suite";
    let shards = split_task(input, 10);
    assert_eq!(shards.len(), 3);
    for shard in &shards {
        assert!(shard.split_whitespace().count() >= 2, "short shard {:?}", shard);
    }
    let mut keys: Vec<String> = shards.iter().map(|s| s.to_lowercase()).collect();
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), shards.len());
}

#[test]
fn output_never_exceeds_the_budget() {
    let input = "- a one\n- b two\n- c three\n- d four\n- e five\n- f six";
    for budget in 1..=6 {
        let shards = split_task(input, budget);
        assert!(shards.len() <= budget);
    }
}

#[test]
fn desired_count_respects_budget_and_floor() {
    let desired = desired_shard_count(
        8,
        "implement the backend api, migrate the database, add tests and deploy",
        2,
    );
    assert!((2..=8).contains(&desired));
    assert_eq!(desired_shard_count(1, "anything at all here", 2), 1);
}

#[test]
fn fallback_padding_is_deterministic_and_sized() {
    let a = fallback_subtasks("update the frontend and add tests", 4);
    let b = fallback_subtasks("update the frontend and add tests", 4);
    assert_eq!(a, b);
    assert_eq!(a.len(), 4);
}

#[test]
fn shard_prompt_carries_the_framing() {
    let prompt = render_shard_prompt(1, 3, "run the tests", "build it and run the tests");
    assert!(prompt.contains("Subtask 2/3:\nrun the tests"));
    assert!(prompt.contains("build it and run the tests"));
}

#[test]
fn retry_prompt_drops_the_original_request() {
    let retry = render_retry_prompt(0, 3, "run the tests");
    assert!(retry.contains("Subtask 1/3:"));
    assert!(!retry.contains("build it and"));
}
