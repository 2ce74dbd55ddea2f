use super::*;
use crate::abort::AbortController;
use crate::task::SENT_TO_WORKER;
use crate::test_utils::*;
use anyhow::Result;
use rstest::rstest;
use static_assertions::assert_impl_all;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

assert_impl_all!(Pool<TestJob, i64>: Send, Sync);
assert_impl_all!(TaskHandle<i64>: Send);
assert_impl_all!(PooledWorker<TestJob, i64>: Send);

/// Polls `check` until it holds or `deadline` elapses.
fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    check()
}

#[test]
fn test_fifo_pool_runs_tasks_to_completion() -> Result<()> {
    let pool = test_builder().pool_size(1).try_build()?;

    let ping = pool.run_task(ping());
    let adds = [(2, 7), (10, 8), (18, 9)].map(|(a, b)| pool.run_task(add(a, b)));

    assert_eq!(ping.join()?, 0);
    let mut results = adds.map(|handle| handle.join().unwrap()).to_vec();
    results.sort_unstable();
    assert_eq!(results, vec![9, 18, 27]);

    let stats = pool.stats();
    assert_eq!(stats.running_tasks, 0);
    assert_eq!(stats.queued_tasks, 0);
    assert_eq!(stats.workers, 1);
    Ok(())
}

#[rstest]
#[case::fifo(false)]
#[case::priority(true)]
fn test_every_submission_reaches_a_terminal_state(#[case] priority: bool) -> Result<()> {
    let mut builder = test_builder().pool_size_bounds(1, 2);
    if priority {
        builder = builder.priority_queue();
    }
    let pool = builder.try_build()?;

    let handles: Vec<_> = (0..24)
        .map(|i| pool.run_task(add(i, i).priority((i % 3) as i32)))
        .collect();
    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.join()?, 2 * i as i64);
    }

    let stats = pool.stats();
    assert_eq!(stats.running_tasks, 0);
    assert_eq!(stats.queued_tasks, 0);
    Ok(())
}

#[test]
fn test_priority_queue_dispatches_lowest_priority_first() -> Result<()> {
    let pool = test_builder().pool_size(1).priority_queue().try_build()?;
    let recorder = Recorder::new();

    // Occupy the only worker so the adds pile up in the wait list.
    let busy = pool.run_task(sleep(150));

    let handles: Vec<_> = [2, 3, 1]
        .into_iter()
        .map(|priority| {
            pool.run_task(
                add(priority as i64, 0)
                    .priority(priority)
                    .on_event(sent_marker(&recorder, &format!("priority-{priority}"))),
            )
        })
        .collect();

    busy.join()?;
    for handle in handles {
        handle.join()?;
    }

    assert_eq!(
        recorder.labels(),
        vec!["priority-1", "priority-2", "priority-3"]
    );
    Ok(())
}

#[test]
fn test_abort_rejects_a_running_task() -> Result<()> {
    let pool = test_builder().pool_size(1).try_build()?;
    let controller = AbortController::new();

    let handle = pool.run_task(
        Task::new("spin", TestJob::default()).abort_signal(controller.signal()),
    );
    thread::sleep(Duration::from_millis(10));
    controller.abort();

    let err = handle.join().unwrap_err();
    assert!(err.is_aborted(), "unexpected error: {err}");

    // The worker observed the flag and serves later tasks normally.
    assert_eq!(pool.run_task(add(1, 1)).join()?, 2);
    Ok(())
}

#[test]
fn test_pre_aborted_signal_rejects_without_dispatch() -> Result<()> {
    let pool = test_builder().pool_size(1).try_build()?;
    let controller = AbortController::new();
    controller.abort();

    let handle = pool.run_task(ping().abort_signal(controller.signal()));
    assert!(handle.is_finished());
    assert!(handle.join().unwrap_err().is_aborted());
    Ok(())
}

#[test]
fn test_abort_of_a_queued_task_leaves_a_skippable_tombstone() -> Result<()> {
    let pool = test_builder().pool_size(1).try_build()?;
    let controller = AbortController::new();

    let busy = pool.run_task(sleep(100));
    let doomed = pool.run_task(add(1, 2).abort_signal(controller.signal()));
    let survivor = pool.run_task(add(3, 4));

    controller.abort();
    assert!(doomed.join().unwrap_err().is_aborted());

    busy.join()?;
    assert_eq!(survivor.join()?, 7);

    let stats = pool.stats();
    assert_eq!(stats.queued_tasks, 0);
    assert_eq!(stats.running_tasks, 0);
    Ok(())
}

#[test]
fn test_abort_after_completion_changes_nothing() -> Result<()> {
    let pool = test_builder().pool_size(1).try_build()?;
    let controller = AbortController::new();

    let handle = pool.run_task(add(2, 2).abort_signal(controller.signal()));
    assert_eq!(handle.join()?, 4);

    // The subscription detached on the terminal transition; firing the
    // signal now must not disturb the pool.
    controller.abort();
    assert_eq!(pool.run_task(add(3, 3)).join()?, 6);
    Ok(())
}

#[test]
fn test_crashed_worker_is_replaced() -> Result<()> {
    let pool = test_builder().pool_size(1).try_build()?;

    let err = pool
        .run_task(Task::new("crash", TestJob::default()))
        .join()
        .unwrap_err();
    assert!(err.is_worker_crash(), "unexpected error: {err}");

    assert!(
        wait_until(Duration::from_millis(100), || pool.stats().workers == 1),
        "worker was not replaced in time"
    );
    assert_eq!(pool.run_task(add(7, 2)).join()?, 9);
    Ok(())
}

#[test]
fn test_handler_failure_surfaces_verbatim() -> Result<()> {
    let pool = test_builder().pool_size(1).try_build()?;

    let err = pool
        .run_task(Task::new("fail", TestJob::default()))
        .join()
        .unwrap_err();
    match err {
        PoolError::Task(inner) => assert_eq!(inner.to_string(), "task says no"),
        other => panic!("unexpected error: {other}"),
    }

    // A handler failure is not a worker fault: the same worker survives.
    assert_eq!(pool.stats().workers, 1);
    assert_eq!(pool.run_task(add(1, 2)).join()?, 3);
    Ok(())
}

#[test]
fn test_unknown_task_type_is_rejected_by_the_worker() -> Result<()> {
    let pool = test_builder().pool_size(1).try_build()?;

    let err = pool
        .run_task(Task::new("transmogrify", TestJob::default()))
        .join()
        .unwrap_err();
    assert!(matches!(err, PoolError::UnknownTaskType(tag) if tag == "transmogrify"));
    Ok(())
}

#[test]
fn test_close_rejects_everything_in_flight() -> Result<()> {
    let pool = test_builder().pool_size(1).try_build()?;

    let running = pool.run_task(sleep(200));
    let queued = pool.run_task(add(1, 1));
    pool.close();

    assert!(running.join().unwrap_err().is_closed());
    assert!(queued.join().unwrap_err().is_closed());

    // Every operation on a closed pool reports the same terminal error.
    assert!(pool.run_task(ping()).join().unwrap_err().is_closed());
    assert!(pool.acquire_worker().unwrap_err().is_closed());
    assert!(pool.wait_for_available_resource().unwrap_err().is_closed());

    let stats = pool.stats();
    assert!(stats.closed);
    assert_eq!(stats.workers, 0);

    // Idempotent.
    pool.close();
    Ok(())
}

#[test]
fn test_acquired_worker_is_exclusive_and_reusable() -> Result<()> {
    let pool = test_builder().pool_size(1).try_build()?;

    let worker = pool.acquire_worker()?;

    // The only worker is reserved, so ordinary submissions must wait.
    let parked = pool.run_task(add(1, 2));
    thread::sleep(Duration::from_millis(30));
    assert!(!parked.is_finished());
    assert_eq!(pool.stats().queued_tasks, 1);

    // Pinned submissions bypass the wait list.
    assert_eq!(pool.run_task_on(add(2, 3), &worker).join()?, 5);

    // One outstanding task per worker, even when pinned.
    let busy = pool.run_task_on(sleep(100), &worker);
    let err = pool.run_task_on(ping(), &worker).join().unwrap_err();
    assert!(matches!(&err, PoolError::Dispatch(_)), "unexpected error: {err}");
    busy.join()?;

    pool.release_worker(worker);
    assert_eq!(parked.join()?, 3);
    Ok(())
}

#[test]
fn test_acquire_waiters_are_served_in_fifo_order() -> Result<()> {
    let pool = Arc::new(test_builder().pool_size(1).try_build()?);
    let recorder = Recorder::new();

    let first = pool.acquire_worker()?;

    let spawn_acquirer = |label: &'static str| {
        let pool = Arc::clone(&pool);
        let recorder = recorder.clone();
        thread::spawn(move || -> Result<()> {
            let worker = pool.acquire_worker()?;
            recorder.push(label);
            pool.release_worker(worker);
            Ok(())
        })
    };

    let a = spawn_acquirer("A");
    thread::sleep(Duration::from_millis(20));
    let b = spawn_acquirer("B");
    thread::sleep(Duration::from_millis(20));

    // Releasing the worker starts the handover chain: A, then B.
    pool.release_worker(first);
    a.join().unwrap()?;
    b.join().unwrap()?;

    assert_eq!(recorder.labels(), vec!["A", "B"]);
    Ok(())
}

#[test]
fn test_pending_acquire_beats_queued_tasks() -> Result<()> {
    let pool = Arc::new(test_builder().pool_size(1).try_build()?);

    let busy = pool.run_task(sleep(80));
    let queued = pool.run_task(add(1, 1));

    let acquirer = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || pool.acquire_worker())
    };
    // Enroll the waiter before the worker frees up.
    thread::sleep(Duration::from_millis(20));

    busy.join()?;
    let worker = acquirer.join().unwrap()?;

    // The freed worker went to the acquirer; the queued task is still
    // parked.
    thread::sleep(Duration::from_millis(20));
    assert!(!queued.is_finished());

    pool.release_worker(worker);
    assert_eq!(queued.join()?, 2);
    Ok(())
}

#[test]
fn test_available_resource_waiters_resolve_in_fifo_order() -> Result<()> {
    let pool = Arc::new(test_builder().pool_size(1).try_build()?);
    let recorder = Recorder::new();

    let t1 = pool.run_task(sleep(60).on_event(sent_marker(&recorder, "task1")));
    let t2 = pool.run_task(sleep(60).on_event(sent_marker(&recorder, "task2")));

    let spawn_waiter = |label: &'static str, tasks: [&'static str; 2]| {
        let pool = Arc::clone(&pool);
        let recorder = recorder.clone();
        thread::spawn(move || -> Result<()> {
            pool.wait_for_available_resource()?;
            recorder.push(label);
            let first = pool.run_task(sleep(30).on_event(sent_marker(&recorder, tasks[0])));
            let second = pool.run_task(sleep(30).on_event(sent_marker(&recorder, tasks[1])));
            first.join()?;
            second.join()?;
            Ok(())
        })
    };

    let w1 = spawn_waiter("W1", ["task3", "task4"]);
    thread::sleep(Duration::from_millis(15));
    let w2 = spawn_waiter("W2", ["task5", "task6"]);

    t1.join()?;
    t2.join()?;
    w1.join().unwrap()?;
    w2.join().unwrap()?;

    assert_eq!(
        recorder.labels(),
        vec!["task1", "task2", "W1", "task3", "task4", "W2", "task5", "task6"]
    );
    Ok(())
}

#[test]
fn test_pool_grows_under_load_and_shrinks_when_idle() -> Result<()> {
    let pool = test_builder()
        .pool_size_bounds(1, 3)
        .shrink_interval(Duration::from_millis(40))
        .try_build()?;

    let handles: Vec<_> = (0..3).map(|_| pool.run_task(sleep(150))).collect();

    assert!(
        wait_until(Duration::from_millis(120), || pool.stats().workers == 3),
        "pool did not grow to its maximum"
    );

    for handle in handles {
        handle.join()?;
    }

    assert!(
        wait_until(Duration::from_millis(600), || pool.stats().workers == 1),
        "pool did not shrink back to its minimum"
    );
    // One idle worker always stays behind; the pool never dips below the
    // configured minimum.
    assert_eq!(pool.stats().workers, 1);
    assert_eq!(pool.stats().idle_workers, 1);
    Ok(())
}

#[test]
fn test_fixed_size_pool_never_grows() -> Result<()> {
    let pool = test_builder().pool_size(2).try_build()?;

    let handles: Vec<_> = (0..6).map(|_| pool.run_task(sleep(30))).collect();
    thread::sleep(Duration::from_millis(15));
    assert_eq!(pool.stats().workers, 2);

    for handle in handles {
        handle.join()?;
    }
    assert_eq!(pool.stats().workers, 2);
    Ok(())
}

#[test]
fn test_release_after_close_is_ignored() -> Result<()> {
    let pool = test_builder().pool_size(1).try_build()?;
    let worker = pool.acquire_worker()?;

    pool.close();
    // The worker was already torn down with the pool; handing it back must
    // be a harmless no-op.
    pool.release_worker(worker);
    assert!(pool.stats().closed);
    Ok(())
}

#[test]
fn test_wait_for_available_resource_returns_at_an_idle_moment() -> Result<()> {
    let pool = test_builder().pool_size(1).try_build()?;

    pool.run_task(ping()).join()?;
    // Idle worker, empty wait list: the next submission would dispatch
    // immediately, so the wait resolves right away.
    pool.wait_for_available_resource()?;
    Ok(())
}

#[test]
fn test_worker_threads_use_the_configured_name() -> Result<()> {
    let pool = Pool::<(), String>::builder()
        .handler("whoami", |_, _scope| -> Result<String> {
            Ok(thread::current().name().unwrap_or_default().to_string())
        })
        .pool_size(1)
        .thread_name("number-cruncher")
        .try_build()?;

    let name = pool.run_task(Task::new("whoami", ())).join()?;
    assert_eq!(name, "number-cruncher");
    Ok(())
}

#[test]
fn test_worker_events_reach_the_callback_in_order() -> Result<()> {
    let recorder = Recorder::new();
    let pool = Pool::<TestJob, i64>::builder()
        .handler("chatty", |_job, scope| -> Result<i64> {
            scope.emit("step", Some("one".into()));
            scope.emit("step", Some("two".into()));
            Ok(0)
        })
        .pool_size(1)
        .try_build()?;

    let events = recorder.clone();
    let handle = pool.run_task(Task::new("chatty", TestJob::default()).on_event(
        move |name, payload| {
            events.push(format!("{name}:{}", payload.unwrap_or("-")));
        },
    ));
    handle.join()?;

    assert_eq!(
        recorder.labels(),
        vec![
            format!("{SENT_TO_WORKER}:-"),
            "step:one".to_string(),
            "step:two".to_string()
        ]
    );
    Ok(())
}

#[test]
fn test_event_callback_panic_is_contained() -> Result<()> {
    let pool = test_builder().pool_size(1).try_build()?;

    let handle = pool.run_task(add(4, 5).on_event(|_name, _payload| {
        panic!("callback blew up");
    }));

    // The callback panic is swallowed; the task and the pool are fine.
    assert_eq!(handle.join()?, 9);
    assert_eq!(pool.run_task(add(1, 1)).join()?, 2);
    Ok(())
}
