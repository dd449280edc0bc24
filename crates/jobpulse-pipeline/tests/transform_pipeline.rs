//! End-to-end transform runs against the in-memory warehouse.

use chrono::{NaiveDate, Utc};

use jobpulse_core::{posting_fingerprint, MappingRuleSet, RawPosting, RuleRow};
use jobpulse_pipeline::{RunOutcome, RuleSets, TransformPipeline, PIPELINE_NAME};
use jobpulse_warehouse::{MemoryWarehouse, Warehouse};

fn rule(keyword: &str, result: &str) -> RuleRow {
    RuleRow {
        keyword: Some(keyword.into()),
        result: Some(result.into()),
        case_sensitive: Some(false),
        spaces_sensitive: Some(false),
    }
}

fn rule_sets() -> RuleSets {
    let positions = MappingRuleSet::from_rows(
        "positions",
        &[
            rule("Data Engineer", "Data Engineer"),
            rule("Analyst", "Data Analyst"),
        ],
    )
    .unwrap();
    let city_clusters = MappingRuleSet::from_rows(
        "city_clusters",
        &[
            rule("berlin", "Berlin"),
            rule("frankfurt", "Frankfurt"),
            rule("oder", "Frankfurt (Oder)"),
        ],
    )
    .unwrap();
    let skills = MappingRuleSet::from_rows(
        "skills",
        &[
            rule("Google BigQuery", "Google BigQuery"),
            rule("SQL", "SQL"),
            rule("Python", "Python"),
        ],
    )
    .unwrap();
    RuleSets {
        positions,
        city_clusters,
        skills,
    }
}

fn raw_posting(load_id: &str, source_row_id: &str, date: NaiveDate) -> RawPosting {
    RawPosting {
        load_id: load_id.to_string(),
        source_row_id: source_row_id.to_string(),
        company: Some("Acme".into()),
        city: Some("Berlin".into()),
        title: Some("Data Engineer".into()),
        occupation: None,
        url: Some("https://jobs.example/1".into()),
        portal: Some("jobs.example".into()),
        experience_months: Some(30.0),
        date_created: date,
        description: Some("We use Google BigQuery and SQL daily".into()),
        locale: Some("en_DE".into()),
    }
}

async fn seed_load(warehouse: &MemoryWarehouse, load_id: &str, rows: &[RawPosting]) {
    warehouse.register_load(load_id, Utc::now()).await.unwrap();
    warehouse.append_raw_postings(rows).await.unwrap();
}

#[tokio::test]
async fn transform_deduplicates_classifies_and_merges() {
    let warehouse = MemoryWarehouse::new();
    let rules = rule_sets();

    let older = raw_posting("load-1", "row-1", NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());
    let newer = raw_posting("load-1", "row-2", NaiveDate::from_ymd_opt(2025, 1, 3).unwrap());
    let mut oder = raw_posting("load-1", "row-3", NaiveDate::from_ymd_opt(2025, 1, 2).unwrap());
    oder.title = Some("Senior Analyst".into());
    oder.city = Some("Frankfurt an der Oder".into());
    oder.description = Some("Python for data pipelines".into());
    oder.experience_months = None;
    seed_load(&warehouse, "load-1", &[older.clone(), newer.clone(), oder.clone()]).await;

    let pipeline = TransformPipeline::new(&warehouse, &rules, "en_DE");
    let outcome = pipeline.run().await.unwrap();
    let summary = match outcome {
        RunOutcome::Completed(summary) => summary,
        RunOutcome::NoNewData => panic!("expected a completed run"),
    };
    assert_eq!(summary.fetched_rows, 3);
    assert_eq!(summary.canonical_rows, 2);
    assert_eq!(summary.loads, vec!["load-1".to_string()]);
    assert_eq!(summary.merged_inserted, 2);
    assert_eq!(summary.merged_updated, 0);

    let duplicate_fp = posting_fingerprint(&newer);
    assert_eq!(duplicate_fp, posting_fingerprint(&older));

    // The duplicate group keeps the 2025-01-03 row; both rows are mapped.
    let matches = warehouse.id_matches();
    assert_eq!(matches.len(), 3);
    let row_1 = matches.iter().find(|m| m.source_row_id == "row-1").unwrap();
    let row_2 = matches.iter().find(|m| m.source_row_id == "row-2").unwrap();
    assert!(!row_1.is_source);
    assert!(row_2.is_source);
    assert_eq!(row_1.posting_id, duplicate_fp);

    let jobs = warehouse.jobs();
    assert_eq!(jobs.len(), 2);
    let canonical = jobs.iter().find(|job| job.id == duplicate_fp).unwrap();
    assert_eq!(
        canonical.date_created,
        NaiveDate::from_ymd_opt(2025, 1, 3).unwrap()
    );
    assert_eq!(canonical.years_of_experience, Some(3));
    assert_eq!(
        canonical.skills,
        vec![
            "Cloud".to_string(),
            "Google BigQuery".to_string(),
            "Google Cloud Platform".to_string(),
            "SQL".to_string(),
        ]
    );
    assert_eq!(canonical.positions, vec!["Data Engineer".to_string()]);
    assert_eq!(canonical.city_clusters, vec!["Berlin".to_string()]);

    // The ambiguous Frankfurt match resolves to the qualified label.
    let oder_fp = posting_fingerprint(&oder);
    let oder_job = jobs.iter().find(|job| job.id == oder_fp).unwrap();
    assert_eq!(oder_job.city_clusters, vec!["Frankfurt (Oder)".to_string()]);
    assert_eq!(oder_job.positions, vec!["Data Analyst".to_string()]);
    assert_eq!(oder_job.years_of_experience, None);

    let skill_rows = warehouse.staged_skills();
    assert_eq!(
        skill_rows
            .iter()
            .filter(|row| row.posting_id == duplicate_fp)
            .count(),
        4
    );
    let position_rows = warehouse.staged_positions();
    assert!(position_rows
        .iter()
        .any(|row| row.posting_id == oder_fp
            && row.title_raw.as_deref() == Some("Senior Analyst")
            && row.position == "Data Analyst"));

    // Ledger bracket: one start entry, one finish entry for the load.
    let ledger = warehouse.ledger_entries();
    let for_load: Vec<_> = ledger
        .iter()
        .filter(|entry| entry.load_id == "load-1" && entry.processed_by == PIPELINE_NAME)
        .collect();
    assert_eq!(for_load.len(), 2);
    assert!(for_load.iter().any(|entry| entry.finished_at.is_none()));
    assert!(for_load.iter().any(|entry| entry.finished_at.is_some()));
}

#[tokio::test]
async fn transform_is_a_noop_without_new_data() {
    let warehouse = MemoryWarehouse::new();
    let rules = rule_sets();
    let pipeline = TransformPipeline::new(&warehouse, &rules, "en_DE");

    let outcome = pipeline.run().await.unwrap();
    assert!(matches!(outcome, RunOutcome::NoNewData));
    assert!(warehouse.ledger_entries().is_empty());
    assert!(warehouse.jobs().is_empty());
}

#[tokio::test]
async fn reprocessing_a_finished_load_is_skipped_and_a_new_load_updates() {
    let warehouse = MemoryWarehouse::new();
    let rules = rule_sets();

    let first = raw_posting("load-1", "row-1", NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());
    seed_load(&warehouse, "load-1", &[first.clone()]).await;

    let pipeline = TransformPipeline::new(&warehouse, &rules, "en_DE");
    let outcome = pipeline.run().await.unwrap();
    assert!(matches!(outcome, RunOutcome::Completed(_)));

    // Same data again: the finished ledger entry excludes the load.
    let outcome = pipeline.run().await.unwrap();
    assert!(matches!(outcome, RunOutcome::NoNewData));

    // A later crawl of the same posting merges as an update, not a new row.
    let mut recrawled = first.clone();
    recrawled.load_id = "load-2".to_string();
    recrawled.source_row_id = "row-2".to_string();
    recrawled.date_created = NaiveDate::from_ymd_opt(2025, 1, 5).unwrap();
    recrawled.portal = Some("other.portal".into());
    seed_load(&warehouse, "load-2", &[recrawled.clone()]).await;

    let outcome = pipeline.run().await.unwrap();
    let summary = match outcome {
        RunOutcome::Completed(summary) => summary,
        RunOutcome::NoNewData => panic!("expected a completed run"),
    };
    assert_eq!(summary.merged_inserted, 0);
    assert_eq!(summary.merged_updated, 1);

    let jobs = warehouse.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].portal.as_deref(), Some("other.portal"));
    assert_eq!(
        jobs[0].date_created,
        NaiveDate::from_ymd_opt(2025, 1, 5).unwrap()
    );
}
