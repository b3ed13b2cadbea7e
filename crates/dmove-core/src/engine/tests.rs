use super::*;
use crate::plan::JobPart;
use crate::task::{TaskBody, TaskSharedStatus};
use std::time::Duration;

fn engine(num_threads: usize, max_memory: u64, disk_threads: usize) -> TransferEngine {
    TransferEngine::new(EngineOptions {
        num_threads: Some(num_threads),
        max_memory_size: Some(max_memory),
        disk_io_threads: disk_threads,
    })
    .unwrap()
}

fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn disk_tasks_limited_by_memory() {
    let engine = engine(2, 200, 4);
    let shared = TaskSharedStatus::new("c");
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));

    for _ in 0..5 {
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        let done = Arc::clone(&done);
        engine.add_task(Task::custom(TaskClass::DiskIo, 100, Arc::clone(&shared), move |_| {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(30));
            running.fetch_sub(1, Ordering::SeqCst);
            done.fetch_add(1, Ordering::SeqCst);
        }));
    }

    wait_until("all disk tasks", || done.load(Ordering::SeqCst) == 5);
    wait_until("engine drained", || engine.outstanding_tasks() == 0);
    assert!(peak.load(Ordering::SeqCst) <= 2, "peak {}", peak.load(Ordering::SeqCst));
    assert_eq!(engine.memory_left(), 200);
}

#[test]
fn disk_admission_is_fifo() {
    let engine = engine(1, 100, 2);
    let shared = TaskSharedStatus::new("fifo");
    let log = Arc::new(Mutex::new(Vec::new()));

    for name in ["a", "b"] {
        let log = Arc::clone(&log);
        engine.add_task(Task::custom(TaskClass::DiskIo, 80, Arc::clone(&shared), move |_| {
            log.lock().unwrap().push(format!("{name}-start"));
            std::thread::sleep(Duration::from_millis(40));
            log.lock().unwrap().push(format!("{name}-end"));
        }));
    }

    wait_until("both tasks", || log.lock().unwrap().len() == 4);
    assert_eq!(*log.lock().unwrap(), vec!["a-start", "a-end", "b-start", "b-end"]);
}

#[test]
fn prepaid_disk_task_passes_blocked_head() {
    let engine = engine(2, 100, 2);
    let shared = TaskSharedStatus::new("prepaid");
    let ran = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));

    // Holds the whole budget until released.
    let gate = Arc::clone(&release);
    engine.add_task(Task::custom(TaskClass::DiskIo, 100, Arc::clone(&shared), move |_| {
        while !gate.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(2));
        }
    }));
    wait_until("gate admitted", || engine.memory_left() == 0);
    engine.add_task(Task::custom(TaskClass::DiskIo, 50, Arc::clone(&shared), |_| {}));
    let flag = Arc::clone(&ran);
    engine.add_task(Task::custom(TaskClass::DiskIo, 0, Arc::clone(&shared), move |_| {
        flag.store(true, Ordering::SeqCst);
    }));

    wait_until("zero-cost task", || ran.load(Ordering::SeqCst));
    release.store(true, Ordering::SeqCst);
    wait_until("engine drained", || engine.outstanding_tasks() == 0);
    assert_eq!(engine.memory_left(), 100);
}

#[test]
fn memory_handed_to_children_comes_back() {
    let engine = engine(3, 1000, 2);
    let shared = TaskSharedStatus::new("mem");
    let wrong = Arc::new(AtomicUsize::new(0));

    for i in 0..20u64 {
        let class = match i % 3 {
            0 => TaskClass::DiskIo,
            1 => TaskClass::NetworkUpload,
            _ => TaskClass::NetworkDownload,
        };
        let wrong = Arc::clone(&wrong);
        engine.add_task(Task::custom(class, 40, Arc::clone(&shared), move |ctx| {
            if ctx.held_memory() != 40 {
                wrong.fetch_add(1, Ordering::SeqCst);
            }
            let child_wrong = Arc::clone(&wrong);
            let child = ctx.child(
                TaskClass::DiskIo,
                0,
                TaskBody::Custom(Box::new(move |ctx| {
                    if ctx.held_memory() != 25 {
                        child_wrong.fetch_add(1, Ordering::SeqCst);
                    }
                })),
            );
            ctx.spawn_with_memory(child, 25);
            if ctx.held_memory() != 15 {
                wrong.fetch_add(1, Ordering::SeqCst);
            }
            let cont = ctx.child(TaskClass::Other, 5, TaskBody::Custom(Box::new(|_| {})));
            ctx.spawn(cont);
        }));
    }

    wait_until("engine drained", || engine.outstanding_tasks() == 0);
    assert_eq!(wrong.load(Ordering::SeqCst), 0);
    assert_eq!(engine.memory_left(), engine.max_memory_size());
}

#[test]
fn pause_parks_tasks_until_resumed() {
    let engine = engine(4, 1 << 20, 2);
    let shared = TaskSharedStatus::new("d");
    let part = JobPart::anonymous("d", 0, 20).unwrap();

    let add = |range: std::ops::Range<usize>| {
        for i in range {
            engine.add_task(
                Task::custom(TaskClass::NetworkUpload, 10, Arc::clone(&shared), |ctx| {
                    let journal = ctx.take_journal();
                    ctx.shared().file_transferred(journal, 1);
                })
                .with_journal(part.journal(i)),
            );
        }
    };

    add(0..10);
    wait_until("first half", || shared.progress().files_transferred == 10);

    assert!(shared.set_status(JobStatus::Paused));
    add(10..20);
    wait_until("tasks parked", || engine.paused_tasks() == 10);
    wait_until("nothing outstanding", || engine.outstanding_tasks() == 0);
    assert_eq!(engine.memory_left(), engine.max_memory_size());
    assert_eq!(shared.progress().files_transferred, 10);

    assert!(shared.set_status(JobStatus::InProgress));
    engine.resume_paused_tasks();
    wait_until("second half", || shared.progress().files_transferred == 20);
    assert!(part.bitmap().all_set());

    // Marking a finished subtask again changes nothing.
    shared.file_transferred(Some(part.journal(3)), 1);
    assert_eq!(shared.progress().files_transferred, 20);
    assert_eq!(engine.paused_tasks(), 0);
}

#[test]
fn task_parked_after_resume_is_requeued() {
    let engine = engine(2, 100, 1);
    let shared = TaskSharedStatus::new("late");
    let ran = Arc::new(AtomicUsize::new(0));

    // A worker saw `Paused`, then the job was resumed and the parked list
    // drained before the worker got to park its task.
    assert!(shared.set_status(JobStatus::Paused));
    assert!(shared.set_status(JobStatus::InProgress));
    engine.resume_paused_tasks();

    let counter = Arc::clone(&ran);
    let task = Task::custom(TaskClass::DiskIo, 30, Arc::clone(&shared), move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    engine.shared.num_tasks.fetch_add(1, Ordering::AcqRel);
    engine.shared.park(task);

    wait_until("requeued task ran", || ran.load(Ordering::SeqCst) == 1);
    wait_until("engine drained", || engine.outstanding_tasks() == 0);
    assert_eq!(engine.paused_tasks(), 0);
    assert_eq!(engine.memory_left(), 100);
}

#[test]
fn task_parked_while_paused_waits_for_resume() {
    let engine = engine(2, 100, 1);
    let shared = TaskSharedStatus::new("held");
    let ran = Arc::new(AtomicUsize::new(0));
    assert!(shared.set_status(JobStatus::Paused));

    let counter = Arc::clone(&ran);
    let task = Task::custom(TaskClass::DiskIo, 30, Arc::clone(&shared), move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    engine.shared.num_tasks.fetch_add(1, Ordering::AcqRel);
    engine.shared.park(task);
    assert_eq!(engine.paused_tasks(), 1);
    assert_eq!(engine.outstanding_tasks(), 0);
    assert_eq!(ran.load(Ordering::SeqCst), 0);

    assert!(shared.set_status(JobStatus::InProgress));
    engine.resume_paused_tasks();
    wait_until("resumed task ran", || ran.load(Ordering::SeqCst) == 1);
    assert_eq!(engine.paused_tasks(), 0);
}

#[test]
fn cancelled_job_tasks_are_dropped() {
    let engine = engine(2, 100, 1);
    let shared = TaskSharedStatus::new("x");
    let ran = Arc::new(AtomicUsize::new(0));
    assert!(shared.set_status(JobStatus::Cancelled));

    for class in [TaskClass::DiskIo, TaskClass::NetworkDownload, TaskClass::Other] {
        let ran = Arc::clone(&ran);
        engine.add_task(Task::custom(class, 30, Arc::clone(&shared), move |_| {
            ran.fetch_add(1, Ordering::SeqCst);
        }));
    }
    wait_until("engine drained", || engine.outstanding_tasks() == 0);
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(engine.memory_left(), 100);
    assert_eq!(engine.paused_tasks(), 0);
}

#[test]
fn timed_task_waits_for_its_deadline() {
    let engine = engine(2, 100, 1);
    let shared = TaskSharedStatus::new("t");
    let fired = Arc::new(Mutex::new(None));
    let start = Instant::now();

    let slot = Arc::clone(&fired);
    engine.add_timed_task(
        Task::custom(TaskClass::Other, 10, Arc::clone(&shared), move |_| {
            *slot.lock().unwrap() = Some(Instant::now());
        }),
        Duration::from_millis(150),
    );
    assert_eq!(engine.outstanding_tasks(), 1);

    wait_until("timed task", || fired.lock().unwrap().is_some());
    let at = fired.lock().unwrap().unwrap();
    assert!(at.duration_since(start) >= Duration::from_millis(150));
    wait_until("engine drained", || engine.outstanding_tasks() == 0);
    assert_eq!(engine.memory_left(), 100);
}

#[test]
fn panicking_task_fails_its_subtask() {
    let engine = engine(1, 100, 1);
    let shared = TaskSharedStatus::new("p");
    let part = JobPart::anonymous("p", 0, 1).unwrap();
    engine.add_task(
        Task::custom(TaskClass::NetworkUpload, 10, Arc::clone(&shared), |_| {
            panic!("boom");
        })
        .with_journal(part.journal(0)),
    );
    wait_until("failure recorded", || shared.progress().files_failed == 1);
    wait_until("engine drained", || engine.outstanding_tasks() == 0);
    assert!(!part.bitmap().is_set(0));
    assert_eq!(engine.memory_left(), 100);
}

#[test]
fn shutdown_drops_queued_work_and_returns_memory() {
    let engine = engine(1, 100, 1);
    let shared = TaskSharedStatus::new("s");
    shared.set_status(JobStatus::Paused);
    for _ in 0..3 {
        engine.add_task(Task::custom(TaskClass::DiskIo, 60, Arc::clone(&shared), |_| {}));
    }
    engine.add_timed_task(
        Task::custom(TaskClass::Other, 5, Arc::clone(&shared), |_| {}),
        Duration::from_secs(3600),
    );
    wait_until("tasks parked", || engine.paused_tasks() == 3);
    engine.shutdown();
    engine.shutdown();
    assert_eq!(engine.memory_left(), 100);
    assert_eq!(engine.outstanding_tasks(), 0);

    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    engine.add_task(Task::custom(TaskClass::Other, 1, shared, move |_| {
        flag.store(true, Ordering::SeqCst);
    }));
    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(engine.memory_left(), 100);
}

#[test]
fn default_options_scale_with_threads() {
    let opts = EngineOptions::default();
    assert!(opts.resolved_threads() >= MIN_THREADS);
    assert_eq!(
        opts.resolved_memory(),
        MEMORY_PER_THREAD * opts.resolved_threads() as u64
    );
    let fixed = EngineOptions {
        num_threads: Some(3),
        max_memory_size: None,
        disk_io_threads: 1,
    };
    assert_eq!(fixed.resolved_memory(), 3 * MEMORY_PER_THREAD);
}
