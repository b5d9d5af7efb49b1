//! End-to-end workflow scenarios against real git repositories.
//!
//! The backend is scripted; everything else (accumulation, decoding, git
//! apply, direct writes, reverts, the verification command) is real.

use std::fs;
use std::path::Path;
use std::time::Duration;

use patchbee::core::types::{
    ApplyMode, IterationFailure, IterationOutcome, Proposal, WorkflowStatus,
};
use patchbee::io::accumulator::{AccumulateOptions, accumulate};
use patchbee::io::decoder::Decoder;
use patchbee::io::git::Git;
use patchbee::io::prompt::{Prompts, TaskDescription};
use patchbee::io::verify::{CommandVerifier, display_command, read_script};
use patchbee::test_support::{ScriptedBackend, TestRepo};
use patchbee::workflow::{
    Collaborators, WorkflowConfig, WorkflowOutcome, WorkflowRequest, run_workflow,
};

/// Passes once `a.py` assigns 3.
const TEST_SCRIPT: &str = "#!/bin/sh\ngrep -qx 'x=3' a.py || { echo \"expected x=3, got $(cat a.py)\" >&2; exit 1; }\n";

fn project() -> TestRepo {
    TestRepo::with_files(&[
        ("a.py", "# the value under test\nx=1\n"),
        ("test.sh", TEST_SCRIPT),
        (".gitignore", "build/\n"),
    ])
    .expect("repo")
}

fn run(
    root: &Path,
    mode: ApplyMode,
    max_iterations: u32,
    backend: &ScriptedBackend,
    fixer: &ScriptedBackend,
) -> WorkflowOutcome {
    let command = vec!["sh".to_string(), "test.sh".to_string()];
    let context = accumulate(
        root,
        &AccumulateOptions {
            scope: None,
            scrub_comments: true,
        },
    )
    .expect("accumulate");
    let task = TaskDescription {
        instructions: Some("Set x to 3".to_string()),
        command: display_command(&command),
        script: read_script(root, &command),
    };
    let prompts = Prompts::new().expect("prompts");
    let decoder = Decoder::new(fixer, &prompts).expect("decoder");
    let verifier = CommandVerifier::new(command.clone(), Duration::from_secs(30), 10_000);

    run_workflow(
        &WorkflowRequest {
            root,
            config: WorkflowConfig {
                mode,
                max_iterations,
            },
            context: &context,
            task: &task,
            command: &command,
        },
        &Collaborators {
            prompts: &prompts,
            backend,
            decoder: &decoder,
            verifier: &verifier,
        },
        |_| {},
    )
    .expect("workflow")
}

fn patch_setting(value: &str) -> String {
    format!(
        "```diff\n--- a/a.py\n+++ b/a.py\n@@ -1,2 +1,2 @@\n # the value under test\n-x=1\n+x={value}\n```"
    )
}

fn edits_setting(value: &str) -> String {
    format!(r#"[{{"path":"a.py","content":"x={value}\n"}},{{"path":"build/cache.txt","content":"{value}"}}]"#)
}

#[test]
fn succeeds_on_second_iteration_and_keeps_its_changes() {
    let repo = project();
    let backend = ScriptedBackend::replies([patch_setting("2"), patch_setting("3")]);
    let fixer = ScriptedBackend::default();

    let outcome = run(repo.path(), ApplyMode::Patch, 5, &backend, &fixer);

    assert_eq!(outcome.state.status, WorkflowStatus::Succeeded);
    assert_eq!(outcome.state.iterations.len(), 2);
    assert_eq!(outcome.state.iterations[0].outcome, IterationOutcome::Retry);
    assert_eq!(outcome.state.iterations[1].outcome, IterationOutcome::Success);
    assert_eq!(repo.read("a.py"), "# the value under test\nx=3\n");

    let retry_prompt = &backend.prompts()[1].1;
    assert!(retry_prompt.contains("expected x=3, got"));
    assert!(retry_prompt.contains("+x=2"));
    assert!(retry_prompt.contains("grep -qx"));
    assert!(retry_prompt.contains("Set x to 3"));
}

#[test]
fn exhaustion_reverts_tree_to_pre_workflow_state() {
    let repo = project();
    let backend = ScriptedBackend::replies([
        edits_setting("2"),
        edits_setting("4"),
        edits_setting("5"),
    ]);
    let fixer = ScriptedBackend::default();

    let outcome = run(repo.path(), ApplyMode::Direct, 3, &backend, &fixer);

    assert_eq!(outcome.state.status, WorkflowStatus::Failed);
    assert_eq!(outcome.state.iterations.len(), 3);
    let outcomes: Vec<IterationOutcome> =
        outcome.state.iterations.iter().map(|i| i.outcome).collect();
    assert_eq!(
        outcomes,
        vec![
            IterationOutcome::Retry,
            IterationOutcome::Retry,
            IterationOutcome::Exhausted
        ]
    );
    assert!(outcome.state.iterations.iter().all(|i| matches!(
        i.failure,
        Some(IterationFailure::Verification(_))
    )));

    assert_eq!(repo.read("a.py"), "# the value under test\nx=1\n");
    assert!(!repo.path().join("build/cache.txt").exists());
    Git::new(repo.path())
        .ensure_clean_except_prefixes(&[".patchbee/"])
        .expect("clean tree");
}

#[test]
fn fixer_repair_does_not_consume_an_iteration() {
    let repo = project();
    let backend = ScriptedBackend::replies(["Sure! Set x to 3 in a.py and you are done."]);
    let fixer = ScriptedBackend::replies([r#"{"scripts":[{"file_path":"a.py","code":"x=3\n"}]}"#]);

    let outcome = run(repo.path(), ApplyMode::Direct, 5, &backend, &fixer);

    assert_eq!(outcome.state.status, WorkflowStatus::Succeeded);
    assert_eq!(outcome.state.iterations.len(), 1);
    assert_eq!(backend.calls(), 1);
    assert_eq!(fixer.calls(), 1);
    assert!(matches!(
        outcome.state.iterations[0].proposal,
        Some(Proposal::Edits(_))
    ));
    assert_eq!(repo.read("a.py"), "x=3\n");
}

#[test]
fn context_sent_to_model_is_scrubbed() {
    let repo = project();
    let backend = ScriptedBackend::replies([patch_setting("3")]);
    let fixer = ScriptedBackend::default();

    run(repo.path(), ApplyMode::Patch, 1, &backend, &fixer);

    let system = &backend.prompts()[0].0;
    assert!(system.contains("--- FILE: a.py ---"));
    assert!(system.contains("x=1"));
    assert!(!system.contains("the value under test"));
}

#[test]
fn run_log_records_every_iteration_and_the_report() {
    let repo = project();
    let backend = ScriptedBackend::replies([patch_setting("2"), patch_setting("3")]);
    let fixer = ScriptedBackend::default();

    let outcome = run(repo.path(), ApplyMode::Patch, 5, &backend, &fixer);

    let run_dir = repo.path().join(".patchbee/runs").join(&outcome.run_id);
    for iter in ["1", "2"] {
        let dir = run_dir.join(iter);
        assert!(dir.join("meta.json").is_file());
        assert!(dir.join("prompt.md").is_file());
        assert!(dir.join("response.txt").is_file());
        assert!(dir.join("proposal.patch").is_file());
        assert!(dir.join("verify.log").is_file());
    }
    let report: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&outcome.report_path).expect("report"))
            .expect("json");
    assert_eq!(report["state"]["status"], "succeeded");
    assert_eq!(report["command"][1], "test.sh");
    assert_eq!(
        fs::read_to_string(repo.path().join(".patchbee/.gitignore")).expect("gitignore"),
        "*\n"
    );
}

#[test]
fn exhaustion_restores_overwritten_ignored_files() {
    let repo = TestRepo::with_files(&[
        ("a.py", "x=1\n"),
        ("test.sh", TEST_SCRIPT),
        (".gitignore", "secret.env\n"),
    ])
    .expect("repo");
    repo.write("secret.env", "TOKEN=orig\n").expect("secret");
    let clobber = r#"[{"path":"secret.env","content":"TOKEN=model\n"},{"path":"a.py","content":"x=2\n"}]"#;
    let backend = ScriptedBackend::replies([clobber, clobber]);
    let fixer = ScriptedBackend::default();

    let outcome = run(repo.path(), ApplyMode::Direct, 2, &backend, &fixer);

    assert_eq!(outcome.state.status, WorkflowStatus::Failed);
    assert_eq!(repo.read("secret.env"), "TOKEN=orig\n");
    assert_eq!(repo.read("a.py"), "x=1\n");
}
