//! End-to-end: submit -> map -> work -> reduce over SQLite stores, real
//! TSV inputs and the filesystem output store.

mod common;

use std::sync::Arc;

use common::{drain, harness, request, write_tsv};
use mergeflow_core::application::DeliveryBudget;
use mergeflow_core::domain::{JobStatus, OutputManifest, Table, UnitLimits};
use mergeflow_core::domain::InvocationState;
use mergeflow_core::port::{InvocationQueue, OutputStore, StateStore};
use mergeflow_infra_system::ConverterRegistry;

fn read_manifest(h: &common::Harness, job_id: &str) -> OutputManifest {
    let path = h.output.root().join("merged/it").join(job_id).join("manifest.json");
    serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
}

#[tokio::test]
async fn test_ten_files_three_per_unit_merge_in_order() {
    let h = harness(
        "ten-files",
        Arc::new(ConverterRegistry::with_builtin()),
        UnitLimits::files(3),
        DeliveryBudget::default(),
    )
    .await;

    let inputs_dir = h.root.join("inputs");
    std::fs::create_dir_all(&inputs_dir).unwrap();
    let inputs = (0..10)
        .map(|i| write_tsv(&inputs_dir, &format!("m{}.tsv", i), &format!("g{}", i), [i as f64, 0.5]))
        .collect();

    let job_id = h.driver.submit(request("run-10", inputs, "tsv", None)).await.unwrap();
    assert_eq!(job_id, "run-10");

    // 1 map + 4 work + 4 reduce
    assert_eq!(drain(&h.worker).await, 9);

    let job = h.driver.poll(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.expected_units, Some(4));
    assert_eq!(job.completed_units, 4);
    assert!(job.completed_at.is_some());

    assert!(h.output.is_finalized(&job.destination, &job_id).await.unwrap());
    let manifest = read_manifest(&h, &job_id);
    assert_eq!(manifest.row_label, "gene");
    assert_eq!(manifest.columns, vec!["CD4", "qc"]);
    assert_eq!(manifest.total_rows, 10);
    let offsets: Vec<u64> = manifest.chunks.iter().map(|c| c.row_offset).collect();
    assert_eq!(offsets, vec![0, 3, 6, 9]);

    // Chunk rows keep input order inside each unit
    let first = h
        .output
        .read_chunk(&job.destination, &job_id, &manifest.chunks[0].chunk_key)
        .await
        .unwrap()
        .unwrap();
    let table = Table::from_chunk_bytes(&first).unwrap();
    let names: Vec<&str> = table.rows.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["g0", "g1", "g2"]);

    assert_eq!(h.queue.count_by_state(InvocationState::Done).await.unwrap(), 9);
    assert_eq!(h.queue.count_by_state(InvocationState::Failed).await.unwrap(), 0);

    let events: Vec<String> = h
        .driver
        .timings(&job_id)
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.event)
        .collect();
    for expected in ["driver_started", "mapper_complete", "reduce_complete"] {
        assert!(events.iter().any(|e| e == expected), "missing {}", expected);
    }
}

#[tokio::test]
async fn test_filter_drops_rows_across_units() {
    let h = harness(
        "filter",
        Arc::new(ConverterRegistry::with_builtin()),
        UnitLimits::files(2),
        DeliveryBudget::default(),
    )
    .await;

    let inputs_dir = h.root.join("inputs");
    std::fs::create_dir_all(&inputs_dir).unwrap();
    let inputs = (0..6)
        .map(|i| write_tsv(&inputs_dir, &format!("m{}.tsv", i), &format!("g{}", i), [i as f64, 1.0]))
        .collect();

    let job_id = h
        .driver
        .submit(request("filtered", inputs, "tsv", Some("CD4 >= 3")))
        .await
        .unwrap();
    drain(&h.worker).await;

    let job = h.driver.poll(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Done);
    let manifest = read_manifest(&h, &job_id);
    assert_eq!(manifest.total_rows, 3);
    let counts: Vec<u64> = manifest.chunks.iter().map(|c| c.row_count).collect();
    assert_eq!(counts, vec![0, 1, 2]);
}

#[tokio::test]
async fn test_missing_input_file_fails_job() {
    let h = harness(
        "missing-input",
        Arc::new(ConverterRegistry::with_builtin()),
        UnitLimits::files(3),
        DeliveryBudget {
            max_attempts: 2,
            ..DeliveryBudget::default()
        },
    )
    .await;

    let inputs = vec![mergeflow_core::domain::InputFile {
        path: h.root.join("nope.tsv").to_string_lossy().into_owned(),
        size_bytes: None,
    }];
    let job_id = h.driver.submit(request("missing", inputs, "tsv", None)).await.unwrap();
    drain(&h.worker).await;

    let job = h.driver.poll(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.failure_reason.is_some());
    assert!(!h.output.is_finalized(&job.destination, &job_id).await.unwrap());
}

#[tokio::test]
async fn test_unsupported_format_rejected_at_submission() {
    let h = harness(
        "bad-format",
        Arc::new(ConverterRegistry::with_builtin()),
        UnitLimits::files(3),
        DeliveryBudget::default(),
    )
    .await;

    let inputs = common::mock_inputs(2);
    let err = h.driver.submit(request("xlsx-job", inputs, "xlsx", None)).await.unwrap_err();
    assert!(matches!(err, mergeflow_core::AppError::InvalidRequest(_)));
    assert!(h.state.get("xlsx-job").await.unwrap().is_none());
}

