use std::path::{Path, PathBuf};

use triage_adapters::{load_fixture_rows, CaseExtractor, RepoClassifier, RowKind};
use triage_core::{CaseOccurrence, JobLinkTemplate};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

#[test]
fn warehouse_sample_matches_snapshot() {
    let root = workspace_root();
    let fixture = load_fixture_rows(root.join("fixtures/warehouse/sample/rows.json")).unwrap();
    let classifier = RepoClassifier::from_yaml_file(root.join("rules/repo_rules.yaml")).unwrap();
    let extractor = CaseExtractor::new(classifier, JobLinkTemplate::default());

    let mut actual = Vec::new();
    let mut skipped = 0;
    for fixture_row in &fixture.rows {
        let kind = if fixture_row.row.pr.is_some() {
            RowKind::PullRequest
        } else {
            RowKind::Nightly
        };
        let batch = extractor.extract_batch(std::slice::from_ref(&fixture_row.row), kind);
        skipped += batch.skipped_rows;
        actual.extend(batch.occurrences);
    }

    let text = std::fs::read_to_string(root.join("fixtures/warehouse/sample/snapshot.json"))
        .expect("read snapshot");
    let expected: Vec<CaseOccurrence> = serde_json::from_str(&text).expect("parse snapshot");
    assert_eq!(actual, expected);
    assert_eq!(skipped, 1);
}
