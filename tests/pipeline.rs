use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tabular_ingest::PipelineConfig;
use tabular_ingest::classifier::KnownHeaders;
use tabular_ingest::config::PathsConfig;
use tabular_ingest::ingestion::observability::{RunContext, RunLog, RunObserver};
use tabular_ingest::mapping::{MappingError, MappingRequest, MappingResponse, SchemaMapper};
use tabular_ingest::pipeline::{
    InMemoryRunStore, Orchestrator, RunStatus, RunStore, Stage, StageStatus, Worker, scan_inbound,
};
use tabular_ingest::types::TokenUsage;

const CONTACTS: &str = "Email,Phone,First Name\n\
ann@example.com,555-0100,Ann\n\
bob@example.com,555-0101,Bob\n";

const ORDERS: &str = "Email;Colour;Size\n\
ANN@example.com;red;M\n\
bob@example.com;blue;L\n\
cid@example.com;green;S\n";

const ORDERS_REPLY: &str = r#"Sure, here is the mapping:
{"header_mapping": {"0": "digid_email", "1": "colour", "2": "size"},
 "normalization_map": {"digid_email": true},
 "matched_columns_count": 1,
 "input_has_header": true,
 "total_columns": 3,
 "column_separators": [";", ";"]}"#;

fn tmp_dir(name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("tabular-ingest-{name}-{nanos}"));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn config_at(root: &Path) -> PipelineConfig {
    let mut config = PipelineConfig {
        paths: PathsConfig::rooted_at(root),
        ..Default::default()
    };
    config.mapping.max_retry_delay_secs = 0;
    config.ensure_directories().unwrap();
    config
}

fn inbound(config: &PipelineConfig, name: &str, contents: &str) -> PathBuf {
    let path = config.paths.inbound_dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

fn orchestrator(config: PipelineConfig, store: Arc<dyn RunStore>) -> Orchestrator {
    Orchestrator::new(config, Arc::new(KnownHeaders::bundled().unwrap()), store)
}

fn memory_store() -> Arc<dyn RunStore> {
    Arc::new(InMemoryRunStore::new())
}

/// Mapper that answers every call the same way and counts calls.
struct FakeMapper {
    reply: Result<MappingResponse, MappingError>,
    calls: AtomicUsize,
}

impl FakeMapper {
    fn answering(text: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Ok(MappingResponse {
                text: text.to_string(),
                usage: TokenUsage {
                    input_tokens: 1_000,
                    output_tokens: 200,
                },
            }),
            calls: AtomicUsize::new(0),
        })
    }

    fn failing(error: MappingError) -> Arc<Self> {
        Arc::new(Self {
            reply: Err(error),
            calls: AtomicUsize::new(0),
        })
    }
}

impl SchemaMapper for FakeMapper {
    fn infer(&self, _request: &MappingRequest) -> Result<MappingResponse, MappingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.reply.clone()
    }
}

fn stage_status(run: &tabular_ingest::pipeline::Run, stage: Stage) -> Option<StageStatus> {
    run.stage_stats.get(stage).map(|r| r.status)
}

#[test]
fn known_headers_take_the_fast_path() {
    let root = tmp_dir("pipe-fast");
    let config = config_at(&root);
    let path = inbound(&config, "contacts.csv", CONTACTS);
    let output = config.paths.output_dir.join("normalized_contacts.csv");
    let logs_dir = config.paths.logs_dir.clone();
    let mapper = FakeMapper::answering(ORDERS_REPLY);
    let orch = orchestrator(config, memory_store()).with_mapper(mapper.clone());

    let run = orch.process_file(&path).unwrap();

    assert_eq!(run.status, RunStatus::Ok, "{:?}", run.error_message);
    assert_eq!(run.error_message, None);
    assert!(run.is_consistent());
    assert_eq!(stage_status(&run, Stage::Classification), Some(StageStatus::Ok));
    assert_eq!(stage_status(&run, Stage::Sampling), Some(StageStatus::Skipped));
    assert_eq!(stage_status(&run, Stage::SchemaMapping), Some(StageStatus::Skipped));
    assert_eq!(stage_status(&run, Stage::Normalization), Some(StageStatus::Ok));
    assert_eq!(mapper.calls.load(Ordering::SeqCst), 0);
    assert_eq!(run.tokens, TokenUsage::default());
    assert_eq!(run.estimated_cost, 0.0);
    assert_eq!(run.known_header_percentage, Some(100.0));
    assert_eq!(run.original_row_count, Some(3));
    assert_eq!(run.final_row_count, Some(3));
    assert_eq!(run.valid_row_percentage, Some(100.0));
    assert!(run.sample_rows.is_none());
    assert!(run.duration_ms.is_some());

    let mapping = run.schema_mapping.as_ref().unwrap();
    assert_eq!(mapping.total_columns, 3);
    assert!(mapping.header_metadata["digid_email"].is_known);

    let written = std::fs::read_to_string(output).unwrap();
    assert!(written.starts_with("\"digid_email\",\"pdata_phone\",\"pdata_first_name\"\n"));
    assert!(written.contains("\"ann@example.com\",\"555-0100\",\"Ann\""));

    let log = std::fs::read_to_string(RunLog::path_for(&logs_dir, run.id, "contacts.csv")).unwrap();
    assert!(log.contains("Starting pipeline for file: contacts.csv"));
    assert!(log.contains("Automatic classification for contacts.csv with known percentage: 100%"));
    assert!(log.contains("Successfully processed contacts.csv"));
    assert!(log.contains("  - Valid row percentage: 100%"));
}

#[test]
fn rejected_file_is_quarantined_and_not_normalized() {
    let root = tmp_dir("pipe-reject");
    let config = config_at(&root);
    let path = inbound(&config, "letter.txt", "Dear customer\nThanks for your order\nRegards\n");
    let quarantined = config.paths.quarantine_dir.join("letter.txt");
    let orch = orchestrator(config, memory_store());

    let run = orch.process_file(&path).unwrap();

    assert_eq!(run.status, RunStatus::Error);
    assert!(run.is_consistent());
    assert!(
        run.error_message
            .as_deref()
            .unwrap()
            .starts_with("classification: Not tabular")
    );
    assert_eq!(stage_status(&run, Stage::Classification), Some(StageStatus::Error));
    assert_eq!(stage_status(&run, Stage::Sampling), None);
    assert_eq!(stage_status(&run, Stage::Normalization), None);
    assert!(!path.exists());
    assert!(quarantined.exists());
}

#[test]
fn empty_file_fails_classification() {
    let root = tmp_dir("pipe-empty");
    let config = config_at(&root);
    let path = inbound(&config, "empty.csv", "");
    let orch = orchestrator(config, memory_store());

    let run = orch.process_file(&path).unwrap();

    assert_eq!(run.status, RunStatus::Error);
    assert_eq!(run.error_message.as_deref(), Some("classification: File is empty"));
    assert_eq!(run.original_file_size, Some(0));
}

#[test]
fn unknown_headers_are_inferred_by_the_mapping_service() {
    let root = tmp_dir("pipe-inferred");
    let config = config_at(&root);
    let path = inbound(&config, "orders.csv", ORDERS);
    let output = config.paths.output_dir.join("normalized_orders.csv");
    let mapper = FakeMapper::answering(ORDERS_REPLY);
    let orch = orchestrator(config, memory_store()).with_mapper(mapper.clone());

    let run = orch.process_file(&path).unwrap();

    assert_eq!(run.status, RunStatus::Ok, "{:?}", run.error_message);
    assert!(run.is_consistent());
    assert_eq!(stage_status(&run, Stage::Sampling), Some(StageStatus::Ok));
    assert_eq!(stage_status(&run, Stage::SchemaMapping), Some(StageStatus::Ok));
    assert_eq!(mapper.calls.load(Ordering::SeqCst), 1);
    assert_eq!(run.sample_rows.as_ref().map(Vec::len), Some(4));
    assert_eq!(run.tokens.input_tokens, 1_000);
    assert_eq!(run.tokens.output_tokens, 200);
    assert!((run.estimated_cost - 0.0008).abs() < 1e-12);
    assert_eq!(run.final_row_count, Some(4));

    let written = std::fs::read_to_string(output).unwrap();
    assert!(written.starts_with("\"digid_email\",\"colour\",\"size\"\n"));
    assert!(written.contains("\"ann@example.com\",\"red\",\"M\""));
}

#[test]
fn quota_failures_end_in_schema_mapping_error() {
    let root = tmp_dir("pipe-quota");
    let config = config_at(&root);
    let path = inbound(&config, "orders.csv", ORDERS);
    let mapper = FakeMapper::failing(MappingError::QuotaExceeded {
        message: "429 Too Many Requests".to_string(),
        retry_after: Some(Duration::from_secs(30)),
    });
    let orch = orchestrator(config, memory_store()).with_mapper(mapper.clone());

    let run = orch.process_file(&path).unwrap();

    assert_eq!(run.status, RunStatus::Error);
    assert!(run.is_consistent());
    assert_eq!(mapper.calls.load(Ordering::SeqCst), 3);
    let message = run.error_message.clone().unwrap();
    assert!(message.starts_with("schema_mapping: schema mapping quota exceeded after 3 attempt(s)"));
    assert!(message.contains("429 Too Many Requests"));
    assert_eq!(stage_status(&run, Stage::SchemaMapping), Some(StageStatus::Error));
    assert_eq!(stage_status(&run, Stage::Normalization), None);
    assert!(path.exists());
}

#[test]
fn timeouts_and_malformed_replies_are_retried_then_reported() {
    for (error, expected) in [
        (
            MappingError::Timeout(Duration::from_secs(180)),
            "schema_mapping: schema mapping timed out after 3 attempt(s)",
        ),
        (
            MappingError::Malformed("no JSON object found in response".to_string()),
            "schema_mapping: schema mapping response malformed after 3 attempt(s)",
        ),
    ] {
        let root = tmp_dir("pipe-retry");
        let config = config_at(&root);
        let path = inbound(&config, "orders.csv", ORDERS);
        let mapper = FakeMapper::failing(error);
        let orch = orchestrator(config, memory_store()).with_mapper(mapper.clone());

        let run = orch.process_file(&path).unwrap();

        assert_eq!(run.status, RunStatus::Error);
        assert_eq!(mapper.calls.load(Ordering::SeqCst), 3);
        assert!(run.error_message.as_deref().unwrap().starts_with(expected));
    }
}

#[test]
fn client_error_is_not_retried() {
    let root = tmp_dir("pipe-client");
    let config = config_at(&root);
    let path = inbound(&config, "orders.csv", ORDERS);
    let mapper = FakeMapper::failing(MappingError::Client("400 Bad Request".to_string()));
    let orch = orchestrator(config, memory_store()).with_mapper(mapper.clone());

    let run = orch.process_file(&path).unwrap();

    assert_eq!(run.status, RunStatus::Error);
    assert_eq!(mapper.calls.load(Ordering::SeqCst), 1);
    assert!(
        run.error_message
            .unwrap()
            .starts_with("schema_mapping: schema mapping failed after 1 attempt(s)")
    );
}

#[test]
fn mapping_without_known_headers_fails_normalization() {
    let root = tmp_dir("pipe-nomatch");
    let config = config_at(&root);
    let path = inbound(&config, "orders.csv", ORDERS);
    let reply = ORDERS_REPLY.replace("digid_email", "contact");
    let orch = orchestrator(config, memory_store()).with_mapper(FakeMapper::answering(&reply));

    let run = orch.process_file(&path).unwrap();

    assert_eq!(run.status, RunStatus::Error);
    assert_eq!(stage_status(&run, Stage::SchemaMapping), Some(StageStatus::Ok));
    assert_eq!(stage_status(&run, Stage::Normalization), Some(StageStatus::Error));
    assert!(
        run.error_message
            .unwrap()
            .starts_with("normalization: No known headers matched in the file.")
    );
}

#[test]
fn failed_run_is_reused_when_the_file_is_processed_again() {
    let root = tmp_dir("pipe-rerun");
    let config = config_at(&root);
    let path = inbound(&config, "orders.csv", ORDERS);
    let store = memory_store();

    let first = orchestrator(config.clone(), Arc::clone(&store))
        .process_file(&path)
        .unwrap();
    assert_eq!(first.status, RunStatus::Error);
    assert!(
        first
            .error_message
            .as_deref()
            .unwrap()
            .contains("no schema-mapping service configured")
    );

    let second = orchestrator(config, Arc::clone(&store))
        .with_mapper(FakeMapper::answering(ORDERS_REPLY))
        .process_file(&path)
        .unwrap();

    assert_eq!(second.id, first.id);
    assert_eq!(second.status, RunStatus::Ok);
    assert_eq!(second.error_message, None);
    assert_eq!(store.list().unwrap().len(), 1);
}

#[test]
fn enqueue_is_idempotent_until_the_run_finishes() {
    let root = tmp_dir("pipe-enqueue");
    let config = config_at(&root);
    inbound(&config, "contacts.csv", CONTACTS);
    let orch = Arc::new(orchestrator(config, memory_store()));

    let a = orch.enqueue("contacts.csv").unwrap();
    let b = orch.enqueue("contacts.csv").unwrap();
    assert_eq!(a, b);

    let run = Worker::new(Arc::clone(&orch)).run_once().unwrap().unwrap();
    assert_eq!(run.id, a);
    assert_eq!(run.status, RunStatus::Ok);

    let c = orch.enqueue("contacts.csv").unwrap();
    assert_ne!(c, a);
}

#[test]
fn worker_processes_oldest_enqueued_run_first() {
    let root = tmp_dir("pipe-worker");
    let config = config_at(&root);
    inbound(&config, "second.csv", CONTACTS);
    inbound(&config, "first.csv", CONTACTS);
    let orch = Arc::new(orchestrator(config, memory_store()));
    orch.enqueue("second.csv").unwrap();
    orch.enqueue("first.csv").unwrap();
    let worker = Worker::new(Arc::clone(&orch));

    let a = worker.run_once().unwrap().unwrap();
    let b = worker.run_once().unwrap().unwrap();

    assert_eq!(a.filename, "second.csv");
    assert_eq!(b.filename, "first.csv");
    assert!(worker.run_once().unwrap().is_none());
}

#[test]
fn worker_skips_a_run_whose_file_is_already_running() {
    let root = tmp_dir("pipe-busy");
    let config = config_at(&root);
    inbound(&config, "other.csv", CONTACTS);
    let store = memory_store();
    store.begin("busy.csv", 1).unwrap();
    let waiting = store.create("busy.csv", 1).unwrap();
    let orch = Arc::new(orchestrator(config, Arc::clone(&store)));
    orch.enqueue("other.csv").unwrap();
    let worker = Worker::new(Arc::clone(&orch));

    let run = worker.run_once().unwrap().unwrap();

    assert_eq!(run.filename, "other.csv");
    assert_eq!(run.status, RunStatus::Ok);
    assert_eq!(store.get(waiting).unwrap().status, RunStatus::Enqueued);
    assert!(worker.run_once().unwrap().is_none());
}

#[test]
fn inbound_scan_enqueues_supported_files_once() {
    let root = tmp_dir("pipe-scan");
    let config = config_at(&root);
    let dir = config.paths.inbound_dir.clone();
    inbound(&config, "b.csv", CONTACTS);
    inbound(&config, "a.tsv", "Email\tPhone\nann@example.com\t555\n");
    inbound(&config, "notes.pdf", "%PDF");
    inbound(&config, ".hidden.csv", CONTACTS);
    let orch = orchestrator(config, memory_store());

    let first = scan_inbound(&orch, &dir).unwrap();
    assert_eq!(first.len(), 2);
    let names: Vec<String> = first
        .iter()
        .map(|id| orch.store().get(*id).unwrap().filename)
        .collect();
    assert_eq!(names, vec!["a.tsv", "b.csv"]);

    assert!(scan_inbound(&orch, &dir).unwrap().is_empty());
}

#[test]
fn malformed_row_is_set_aside_and_the_run_still_succeeds() {
    let root = tmp_dir("pipe-badrow");
    let config = config_at(&root);
    let path = inbound(
        &config,
        "people.csv",
        "Email,Phone,First Name,City\n\
         ann@example.com,555-0100,Ann,Paris\n\
         bob@example.com,555-0101,Bob,Rome,Lazio\n\
         cid@example.com,555-0102,Cid,Oslo\n",
    );
    let invalid = config.paths.invalid_dir.join("invalid_rows_people.csv");
    let orch = orchestrator(config, memory_store());

    let run = orch.process_file(&path).unwrap();

    assert_eq!(run.status, RunStatus::Ok, "{:?}", run.error_message);
    assert_eq!(run.invalid_line_numbers, vec![3]);
    assert_eq!(run.original_row_count, Some(4));
    assert_eq!(run.final_row_count, Some(3));
    assert_eq!(run.valid_row_percentage, Some(75.0));
    let normalization = run.stage_stats.get(Stage::Normalization).unwrap();
    assert_eq!(
        normalization.warnings,
        vec!["3 of 4 non-empty rows written to normalized CSV (some rows were skipped)"]
    );

    let side = std::fs::read_to_string(invalid).unwrap();
    let mut lines = side.lines();
    assert_eq!(lines.next(), Some("Row_Number,Reason,Original_Line"));
    let row = lines.next().unwrap();
    assert!(row.starts_with("3,"));
    assert!(row.contains("Column count mismatch (got 5, expected 4)"));
}

#[derive(Default)]
struct StageRecorder {
    seen: Mutex<Vec<(Stage, StageStatus)>>,
    finished: AtomicUsize,
}

impl RunObserver for StageRecorder {
    fn on_stage(&self, _ctx: &RunContext, stage: Stage, status: StageStatus, _d: Option<&str>) {
        self.seen.lock().unwrap().push((stage, status));
    }

    fn on_finished(&self, _ctx: &RunContext, _run: &tabular_ingest::pipeline::Run) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn observer_sees_every_transition_in_order() {
    let root = tmp_dir("pipe-observer");
    let config = config_at(&root);
    let path = inbound(&config, "contacts.csv", CONTACTS);
    let recorder = Arc::new(StageRecorder::default());
    let orch = orchestrator(config, memory_store()).with_observer(recorder.clone());

    orch.process_file(&path).unwrap();

    assert_eq!(
        *recorder.seen.lock().unwrap(),
        vec![
            (Stage::Classification, StageStatus::Running),
            (Stage::Classification, StageStatus::Ok),
            (Stage::Sampling, StageStatus::Skipped),
            (Stage::SchemaMapping, StageStatus::Skipped),
            (Stage::Normalization, StageStatus::Running),
            (Stage::Normalization, StageStatus::Ok),
        ]
    );
    assert_eq!(recorder.finished.load(Ordering::SeqCst), 1);
}

#[test]
fn worker_loop_stops_when_asked() {
    let root = tmp_dir("pipe-shutdown");
    let mut config = config_at(&root);
    config.worker.idle_poll_secs = 1;
    inbound(&config, "contacts.csv", CONTACTS);
    let orch = Arc::new(orchestrator(config, memory_store()));
    let worker = Worker::new(Arc::clone(&orch)).with_inbound_scan(true);
    let stop = worker.shutdown_handle();

    let handle = std::thread::spawn(move || worker.run());
    let deadline = SystemTime::now() + Duration::from_secs(10);
    while orch
        .store()
        .find_by_filename("contacts.csv")
        .unwrap()
        .is_none_or(|r| !r.status.is_terminal())
        && SystemTime::now() < deadline
    {
        std::thread::sleep(Duration::from_millis(20));
    }
    stop.store(true, Ordering::SeqCst);
    handle.join().unwrap();

    let run = orch.store().find_by_filename("contacts.csv").unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Ok);
}
