use super::*;
use crate::engine::EngineOptions;
use crate::journal::{open_part_file, part_file_name};
use crate::plan::{JobPlan, PlanLimits, TransferEnd};
use crate::remote::{LocalDirStore, RemoteStore};
use crate::retry::RetryPolicy;
use crate::task::{block_id, JobStatus};
use std::fs;
use std::time::Duration;

struct Fixture {
    jobs: JobEngine,
    local: LocalDirStore,
    dir: tempfile::TempDir,
}

impl Fixture {
    fn new() -> Self {
        Self::with_limits(PlanLimits::default())
    }

    fn with_limits(limits: PlanLimits) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let local = LocalDirStore::open(dir.path().join("store")).unwrap();
        let engine = Arc::new(
            TransferEngine::new(EngineOptions {
                num_threads: Some(2),
                max_memory_size: Some(16 * 1024 * 1024),
                disk_io_threads: 1,
            })
            .unwrap(),
        );
        let mut settings = PlanSettings::default();
        settings.retry = RetryPolicy::no_retry();
        settings.limits = limits;
        settings.copy_poll_interval = Duration::from_millis(20);
        let jobs = JobEngine::start(
            engine,
            JobEngineOptions {
                plans_dir: dir.path().join("plans"),
                settings,
                task_refill_threshold: DEFAULT_REFILL_THRESHOLD,
            },
        )
        .unwrap();
        fs::create_dir_all(dir.path().join("plans")).unwrap();
        Self { jobs, local, dir }
    }

    fn plans(&self) -> PathBuf {
        self.dir.path().join("plans")
    }

    fn store(&self) -> Arc<dyn RemoteStore> {
        Arc::new(self.local.clone())
    }

    /// Write the parts of a fresh plan for `model`, then mark `done` chunks
    /// of part 0 as if a run had stopped after finishing them.
    fn interrupted_plan(
        &self,
        job_id: &str,
        model: &JobModel,
        params: HydrationParameters,
        done: &[usize],
    ) {
        JobPlan::create(&self.plans(), job_id, model).unwrap();
        let mut plan = JobPlan::load(
            &self.plans(),
            job_id,
            params,
            PlanSettings {
                limits: chunked(),
                ..PlanSettings::default()
            },
            Arc::new(|_: &str, _: u32| {}),
        )
        .unwrap();
        assert_eq!(plan.generate_parts().unwrap(), vec![0]);
        drop(plan);
        let part = open_part_file(&self.plans().join(job_id).join(part_file_name(0))).unwrap();
        for &i in done {
            assert!(part.bitmap.set(i));
        }
    }

    /// A copy slow enough to still be running when the test acts on it.
    fn slow_copy(&self) -> (JobModel, HydrationParameters) {
        self.local.put_object("src/obj", b"data").unwrap();
        self.local.set_copy_delay(Duration::from_millis(500));
        let model = JobModel {
            source: TransferEnd::remote_object(&self.local, "src/obj"),
            destination: TransferEnd::remote_object(&self.local, "dst/obj"),
        };
        let params = HydrationParameters {
            source_store: Some(self.store()),
            destination_store: Some(self.store()),
            ..Default::default()
        };
        (model, params)
    }
}

const CHUNK: u64 = 1000;
const OBJECT_LEN: usize = 3500;

fn chunked() -> PlanLimits {
    PlanLimits {
        upload_block_size: CHUNK,
        download_block_size: CHUNK,
        ..PlanLimits::default()
    }
}

fn content() -> Vec<u8> {
    (0..OBJECT_LEN).map(|i| (i % 251) as u8).collect()
}

fn chunk(data: &[u8], i: usize) -> std::ops::Range<usize> {
    let start = i * CHUNK as usize;
    start..(start + CHUNK as usize).min(data.len())
}

fn wait_terminal(props: &JobProperties) -> JobStatus {
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        let status = props.wait_handle.status();
        if status.is_terminal() {
            return status;
        }
        assert!(std::time::Instant::now() < deadline, "job stuck in {status:?}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn chunked_upload_resumes_from_its_staged_blocks() {
    let fx = Fixture::with_limits(chunked());
    let expected = content();
    let src = fx.dir.path().join("big.bin");
    let model = JobModel {
        source: TransferEnd::local_file(&src).unwrap(),
        destination: TransferEnd::remote_object(&fx.local, "big"),
    };
    let params = || HydrationParameters {
        destination_store: Some(fx.store()),
        ..Default::default()
    };
    fs::write(&src, &expected).unwrap();
    fx.interrupted_plan("up", &model, params(), &[0, 2]);
    for i in [0, 2] {
        fx.local
            .stage_block("big", &block_id(i as u32), &expected[chunk(&expected, i)])
            .unwrap();
    }

    // Finished chunks must come from the staged blocks, not the file.
    let mut changed = expected.clone();
    for i in [0, 2] {
        changed[chunk(&expected, i)].fill(0xff);
    }
    fs::write(&src, &changed).unwrap();

    let props = fx.jobs.resume_job("up", params()).unwrap();
    assert_eq!(wait_terminal(&props), JobStatus::Succeeded);
    let stored = fs::read(fx.local.object_path("big").unwrap()).unwrap();
    assert_eq!(stored, expected);
    assert_eq!(fx.local.object_writes(), 1);
    assert!(!fx.plans().join("up").exists());
}

#[test]
fn chunked_download_resumes_into_its_part_file() {
    let fx = Fixture::with_limits(chunked());
    let expected = content();
    let out = fx.dir.path().join("out");
    fs::create_dir_all(&out).unwrap();
    let dest = out.join("big.bin");
    fx.local.put_object("big", &expected).unwrap();
    let model = JobModel {
        source: TransferEnd::remote_object(&fx.local, "big"),
        destination: TransferEnd::local_file(&dest).unwrap(),
    };
    let params = || HydrationParameters {
        source_store: Some(fx.store()),
        ..Default::default()
    };
    fx.interrupted_plan("down", &model, params(), &[1, 3]);

    let mut partial = vec![0u8; OBJECT_LEN];
    let mut changed = expected.clone();
    for i in [1, 3] {
        let r = chunk(&expected, i);
        partial[r.clone()].copy_from_slice(&expected[r.clone()]);
        changed[r].fill(0xff);
    }
    fs::write(crate::storage::temp_path(&dest), &partial).unwrap();
    // Finished chunks must stay as the part file has them.
    fx.local.put_object("big", &changed).unwrap();

    let props = fx.jobs.resume_job("down", params()).unwrap();
    assert_eq!(wait_terminal(&props), JobStatus::Succeeded);
    assert_eq!(fs::read(&dest).unwrap(), expected);
    assert!(!crate::storage::temp_path(&dest).exists());
    assert!(!fx.plans().join("down").exists());
}

#[test]
fn duplicate_job_ids_are_rejected() {
    let fx = Fixture::new();
    let (model, params) = fx.slow_copy();
    let props = fx.jobs.create_job("job-1", model.clone(), params.clone()).unwrap();
    assert_eq!(props.id, "job-1");
    assert!(fx.plans().join("job-1").is_dir());
    assert!(matches!(
        fx.jobs.create_job("job-1", model, params),
        Err(Error::JobAlreadyExists(id)) if id == "job-1"
    ));
}

#[test]
fn loaded_jobs_cannot_be_removed_but_can_be_cancelled() {
    let fx = Fixture::new();
    let (model, params) = fx.slow_copy();
    let props = fx.jobs.create_job("job-2", model, params).unwrap();

    fx.jobs.pause_job("job-2").unwrap();
    assert!(matches!(
        fx.jobs.remove_job("job-2"),
        Err(Error::InvalidState { status: JobStatus::Paused, .. })
    ));
    fx.jobs.cancel_job("job-2").unwrap();
    assert_eq!(props.wait_handle.status(), JobStatus::Cancelled);
    assert!(!fx.plans().join("job-2").exists());
    assert!(matches!(fx.jobs.pause_job("job-2"), Err(Error::JobNotFound(_))));
}

#[test]
fn corrupt_part_fails_the_job_and_keeps_its_plan() {
    let fx = Fixture::new();
    let src = fx.dir.path().join("file");
    fs::write(&src, b"abc").unwrap();
    let model = JobModel {
        source: TransferEnd::local_file(&src).unwrap(),
        destination: TransferEnd::remote_object(&fx.local, "obj"),
    };
    let dir = JobPlan::create(&fx.plans(), "job-3", &model).unwrap();
    fs::write(dir.join("00000000"), b"not a part").unwrap();

    let props = fx
        .jobs
        .resume_job(
            "job-3",
            HydrationParameters {
                destination_store: Some(fx.store()),
                ..Default::default()
            },
        )
        .unwrap();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while props.wait_handle.status() == JobStatus::InProgress {
        assert!(std::time::Instant::now() < deadline, "job never failed");
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(props.wait_handle.status(), JobStatus::Failed);
    assert!(dir.join("00000000").is_file());
    assert_eq!(fx.local.object_writes(), 0);

    // Unloaded, so it can be removed now.
    fx.jobs.remove_job("job-3").unwrap();
    assert!(!dir.exists());
}

#[test]
fn stop_pauses_running_jobs() {
    let fx = Fixture::new();
    let (model, params) = fx.slow_copy();
    let props = fx.jobs.create_job("job-4", model.clone(), params.clone()).unwrap();
    fx.jobs.stop();
    fx.jobs.stop();
    assert_eq!(props.wait_handle.status(), JobStatus::Paused);
    assert!(fx.plans().join("job-4").is_dir());
    assert!(matches!(
        fx.jobs.create_job("job-5", model, params),
        Err(Error::EngineStopped)
    ));
}
