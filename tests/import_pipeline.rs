//! End-to-end import tests: fetch, normalize, index, swap, then query.

use npsearch::NonprofitIndex;
use npsearch::config::AppConfig;
use npsearch::error::{FetchError, ImportError};
use npsearch::fetch::{
    FetchCheckpoint, Fetcher, FileTransport, Opened, RetryPolicy, SourceDescriptor, Transport,
};
use npsearch::import::pipeline::{PipelineOptions, ingest};
use npsearch::import::staging::StageWriter;
use npsearch::import::{ImportJob, JobCheckpoint, JobState, JobStore};
use npsearch::index::{Ein, Organization};
use npsearch::query::{ExportFormat, Filters, SearchRequest};
use npsearch::utils::{CancelToken, jobs_dir};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

/// Ten data rows: one unparsable revenue (coerced to 0) and one EIN listed twice
const FIXTURE: &str = "\
EIN,NAME,STREET,CITY,STATE,ZIP,NTEE_CD,ASSET_AMT,INCOME_AMT,REVENUE_AMT
010000001,River Food Bank,1 Main St,Austin,TX,78701,K31,500000,250000,1200000
010000002,Hill Arts Guild,2 Oak Ave,Boston,MA,02108,A20,10000,5000,20000
010000003,Valley Health Clinic,3 Elm St,Fresno,CA,93701,E40,900000,800000,750000
010000004,Coastal Animal Rescue,4 Bay Rd,San Diego,CA,92101,D20,40000,30000,oops
010000005,Youth Soccer League,5 Park Ln,Columbus,OH,43004,N64,2000,1000,15000
010000006,Historical Society of Salem,6 Church St,Salem,MA,01970,A80,300000,20000,45000
010000007,Community Food Pantry,7 Pine Rd,Oakland,CA,94601,K31,75000,60000,98000
010000008,First Street Church,8 First St,Dallas,TX,75201,X20,1500000,400000,600000
010000009,Literacy Project,9 Book Way,Portland,OR,97201,B60,12000,9000,30000
010000003,Valley Health Center,3 Elm St,Fresno,CA,93701,E40,950000,820000,800000
";

struct Fixture {
    dir: TempDir,
    source: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("eo_test.csv");
        std::fs::write(&source, FIXTURE).unwrap();
        Self { dir, source }
    }

    fn descriptor(&self) -> SourceDescriptor {
        SourceDescriptor::new(vec![self.source.display().to_string()])
    }

    fn data_dir(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

fn config() -> AppConfig {
    let mut config = AppConfig::default();
    config.import.chunk_rows = 2;
    config.import.normalizer_workers = 3;
    config.index.shard_workers = 2;
    config.fetch.retry = RetryPolicy {
        max_attempts: 4,
        base_delay_ms: 1,
        max_delay_ms: 5,
    };
    config
}

fn open(data_dir: &Path, transport: Arc<dyn Transport>) -> NonprofitIndex {
    NonprofitIndex::open_with_transport(&config(), data_dir, transport).unwrap()
}

fn import(index: &NonprofitIndex, source: SourceDescriptor) -> ImportJob {
    index.start_import(source).unwrap();
    index.wait_for_import().unwrap()
}

fn export_csv(index: &NonprofitIndex) -> String {
    export(index, &Filters::default(), ExportFormat::Csv)
}

fn export(index: &NonprofitIndex, filters: &Filters, format: ExportFormat) -> String {
    let mut out = String::new();
    index
        .export(None, filters, format)
        .unwrap()
        .read_to_string(&mut out)
        .unwrap();
    out
}

/// Decode an export with its header row
fn csv_records(out: &str, has_headers: bool) -> (Vec<String>, Vec<csv::StringRecord>) {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(has_headers)
        .from_reader(out.as_bytes());
    let header = if has_headers {
        reader.headers().unwrap().iter().map(str::to_string).collect()
    } else {
        Vec::new()
    };
    let records = reader.records().map(|r| r.unwrap()).collect();
    (header, records)
}

#[test]
fn ten_row_fixture_end_to_end() {
    let fixture = Fixture::new();
    let index = open(&fixture.data_dir("data"), Arc::new(FileTransport));

    let job = import(&index, fixture.descriptor());
    assert_eq!(job.state, JobState::Completed, "job failed: {:?}", job.error);
    assert_eq!(job.rows_read, 10);
    assert_eq!(job.rows_rejected, 0);
    assert_eq!(job.rows_coerced, 1);
    assert_eq!(job.organizations, Some(9));
    assert_eq!(job.duplicates, 1);
    assert!(!job.degraded);

    // Exact name ranks first
    let results = index.search(&SearchRequest::term("River Food Bank")).unwrap();
    assert_eq!(results.results[0].organization.ein.as_str(), "010000001");

    // State filter narrows to the CA rows
    let ca = index
        .search(&SearchRequest::default().with_filters(Filters {
            state: Some("ca".to_string()),
            ..Default::default()
        }))
        .unwrap();
    assert_eq!(ca.total_matched, 3);
    assert!(ca.results.iter().all(|hit| hit.organization.state == "CA"));

    // Later duplicate wins
    let clinic = index.organization("01-0000003").unwrap();
    assert_eq!(clinic.name, "Valley Health Center");
    assert_eq!(clinic.revenue, 800_000);

    // Coerced revenue is zero, the rest of the row is kept
    let rescue = index.organization("010000004").unwrap();
    assert_eq!(rescue.revenue, 0);
    assert_eq!(rescue.assets, 40_000);

    let csv = export_csv(&index);
    let mut lines = csv.lines();
    assert_eq!(lines.next().unwrap(), Organization::COLUMNS.join(","));
    assert_eq!(lines.count(), 9);

    let health = index.health();
    assert_eq!(health.active_generation, 1);
    assert_eq!(health.organizations, 9);
    assert!(health.last_import_completed_at.is_some());
}

#[test]
fn reimport_is_idempotent() {
    let fixture = Fixture::new();
    let index = open(&fixture.data_dir("data"), Arc::new(FileTransport));

    import(&index, fixture.descriptor());
    let first = export_csv(&index);
    let first_gen = index.health().active_generation;

    index.acknowledge().unwrap();
    let job = import(&index, fixture.descriptor());
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(index.health().active_generation, first_gen + 1);
    assert_eq!(export_csv(&index), first);
}

#[test]
fn resume_after_crash_matches_uninterrupted_run() {
    let fixture = Fixture::new();

    let reference = {
        let index = open(&fixture.data_dir("reference"), Arc::new(FileTransport));
        import(&index, fixture.descriptor());
        export_csv(&index)
    };

    // Run the first chunks of an import by hand, then stop as a crash would:
    // the third chunk is staged but its checkpoint is never persisted.
    let data_dir = fixture.data_dir("crashed");
    let jobs = JobStore::new(jobs_dir(&data_dir));
    let mut job = ImportJob::new(fixture.descriptor());
    job.transition(JobState::Fetching).unwrap();
    jobs.save(&job).unwrap();
    jobs.set_current(&job.id).unwrap();

    let cancel = CancelToken::new();
    let fetcher = Fetcher::new(
        fixture.descriptor(),
        Arc::new(FileTransport),
        RetryPolicy::default(),
        2,
        cancel.clone(),
    );
    let mut stage = StageWriter::open(&jobs.staging_path(&job.id), 0, 0).unwrap();
    let options = PipelineOptions {
        workers: 2,
        raw_capacity: 1,
        normalized_capacity: 1,
    };
    let mut chunks = 0;
    let crashed = ingest(&fetcher, FetchCheckpoint::default(), &mut stage, &options, &cancel, |chunk| {
        chunks += 1;
        if chunks == 3 {
            return Err(ImportError::Worker("simulated crash".to_string()));
        }
        job.rows_read += chunk.rows;
        job.rows_coerced += chunk.coerced;
        job.checkpoint = JobCheckpoint {
            fetch: chunk.end,
            staged_bytes: chunk.staged_bytes,
            staged_records: chunk.staged_records,
        };
        jobs.save(&job)
    });
    assert!(crashed.is_err());
    drop(stage);

    let index = open(&data_dir, Arc::new(FileTransport));
    assert_eq!(index.health().active_generation, 0);
    let resumed = index.resume_import().unwrap();
    assert_eq!(resumed.as_deref(), Some(job.id.as_str()));

    let finished = index.wait_for_import().unwrap();
    assert_eq!(finished.state, JobState::Completed, "job failed: {:?}", finished.error);
    assert_eq!(finished.resumes, 1);
    assert_eq!(finished.rows_read, 10);
    assert_eq!(finished.organizations, Some(9));
    assert_eq!(export_csv(&index), reference);
}

/// Fails the first `failures` opens with a transient error
struct FlakyTransport {
    failures: u32,
    attempts: AtomicU32,
}

impl Transport for FlakyTransport {
    fn open(&self, url: &str, offset: u64) -> Result<Opened, FetchError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err(FetchError::transient(url, "connection reset"));
        }
        FileTransport.open(url, offset)
    }
}

#[test]
fn transient_failures_are_retried() {
    let fixture = Fixture::new();
    let transport = Arc::new(FlakyTransport {
        failures: 2,
        attempts: AtomicU32::new(0),
    });
    let index = open(&fixture.data_dir("data"), transport.clone());

    let job = import(&index, fixture.descriptor());
    assert_eq!(job.state, JobState::Completed, "job failed: {:?}", job.error);
    assert_eq!(transport.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(job.organizations, Some(9));
}

#[test]
fn failed_import_keeps_active_index() {
    let fixture = Fixture::new();
    let index = open(&fixture.data_dir("data"), Arc::new(FileTransport));
    import(&index, fixture.descriptor());
    let before = export_csv(&index);

    let missing = SourceDescriptor::new(vec![fixture.dir.path().join("missing.csv").display().to_string()]);
    let job = import(&index, missing);
    assert_eq!(job.state, JobState::Failed);
    assert!(job.error.is_some());
    assert_eq!(job.target_generation, None);

    let health = index.health();
    assert_eq!(health.active_generation, 1);
    assert_eq!(health.import_state, Some(JobState::Failed));
    assert_eq!(export_csv(&index), before);
    assert_eq!(index.search(&SearchRequest::term("food")).unwrap().total_matched, 2);
}

#[test]
fn all_rows_rejected_fails_without_swap() {
    let fixture = Fixture::new();
    let bad = fixture.dir.path().join("bad.csv");
    std::fs::write(&bad, "EIN,NAME\nnot-an-ein,Nobody\n,Blank\n").unwrap();
    let index = open(&fixture.data_dir("data"), Arc::new(FileTransport));

    let job = import(&index, SourceDescriptor::new(vec![bad.display().to_string()]));
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.rows_rejected, 2);
    assert!(job.degraded);
    assert_eq!(job.rejections.get("invalid_ein"), Some(&1));
    assert_eq!(job.rejections.get("missing_ein"), Some(&1));
    assert_eq!(index.health().active_generation, 0);
}

#[test]
fn second_import_while_running_is_rejected() {
    let fixture = Fixture::new();
    let index = open(&fixture.data_dir("data"), Arc::new(FileTransport));
    let id = index.start_import(fixture.descriptor()).unwrap();

    match index.start_import(fixture.descriptor()) {
        // The first job may already have finished on a fast machine
        Ok(_) => {}
        Err(ImportError::JobInProgress { job_id }) => assert_eq!(job_id, id),
        Err(e) => panic!("unexpected error {e}"),
    }
    index.wait_for_import();
    assert!(index.import_status(&id).is_some());
}

#[test]
fn filtered_csv_export_has_header_and_only_matches() {
    let fixture = Fixture::new();
    let index = open(&fixture.data_dir("data"), Arc::new(FileTransport));
    import(&index, fixture.descriptor());

    let filters = Filters {
        state: Some("CA".to_string()),
        ..Default::default()
    };
    let out = export(&index, &filters, ExportFormat::Csv);
    let (header, records) = csv_records(&out, true);
    assert_eq!(header, Organization::COLUMNS);
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| &r[4] == "CA"));
    let eins: Vec<&str> = records.iter().map(|r| &r[0]).collect();
    assert_eq!(eins, vec!["010000003", "010000004", "010000007"]);
}

#[test]
fn json_export_is_a_well_formed_array() {
    let fixture = Fixture::new();
    let index = open(&fixture.data_dir("data"), Arc::new(FileTransport));
    import(&index, fixture.descriptor());

    let out = export(&index, &Filters::default(), ExportFormat::Json);
    assert!(out.trim_start().starts_with('['));
    assert!(out.trim_end().ends_with(']'));
    let orgs: Vec<Organization> = serde_json::from_str(&out).unwrap();
    assert_eq!(orgs.len(), 9);
    assert!(orgs.windows(2).all(|w| w[0].ein < w[1].ein));
    assert_eq!(orgs[2].name, "Valley Health Center");
}

#[test]
fn resume_export_continues_after_middle_cursor() {
    let fixture = Fixture::new();
    let index = open(&fixture.data_dir("data"), Arc::new(FileTransport));
    import(&index, fixture.descriptor());

    let cursor = Ein::parse("010000005").unwrap();
    let mut out = String::new();
    index
        .resume_export(None, &Filters::default(), ExportFormat::Csv, &cursor)
        .unwrap()
        .read_to_string(&mut out)
        .unwrap();

    // No header on a resumed stream
    let (_, records) = csv_records(&out, false);
    let eins: Vec<&str> = records.iter().map(|r| &r[0]).collect();
    assert_eq!(eins, vec!["010000006", "010000007", "010000008", "010000009"]);
}

#[test]
fn quoted_multiline_name_imports_as_one_row() {
    let fixture = Fixture::new();
    let source = fixture.dir.path().join("multiline.csv");
    std::fs::write(&source, "EIN,NAME,STATE\n010000001,\"River Food\nBank\",TX\n").unwrap();
    let index = open(&fixture.data_dir("data"), Arc::new(FileTransport));

    let job = import(&index, SourceDescriptor::new(vec![source.display().to_string()]));
    assert_eq!(job.state, JobState::Completed, "job failed: {:?}", job.error);
    assert_eq!(job.rows_read, 1);
    assert_eq!(index.organization("010000001").unwrap().name, "River Food\nBank");

    let (_, records) = csv_records(&export_csv(&index), true);
    assert_eq!(records.len(), 1);
    assert_eq!(&records[0][1], "River Food\nBank");
}
