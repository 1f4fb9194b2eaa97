use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel;
use taskloom::{default_handle, Loom, LoomConfig, LoomThread, TaskError, TaskSpec};

#[test]
fn test_many_submitters_one_control_thread() {
    let control = LoomThread::spawn(LoomConfig::with_max_threads(3)).unwrap();
    let (done_tx, done_rx) = channel::unbounded();
    let delivered = Arc::new(AtomicUsize::new(0));

    let submitters: Vec<_> = (0..4)
        .map(|worker| {
            let handle = control.handle().clone();
            let done_tx = done_tx.clone();
            let delivered = delivered.clone();
            thread::spawn(move || {
                for i in 0..25 {
                    let done_tx = done_tx.clone();
                    let delivered = delivered.clone();
                    let spec = TaskSpec::builder(format!("w{}-{}", worker, i)).build(
                        i,
                        |n: &u32, _| Ok(n * 2),
                        move |n: &u32, result: Result<u32, TaskError>| {
                            assert_eq!(result.unwrap(), n * 2);
                            delivered.fetch_add(1, Ordering::SeqCst);
                            let _ = done_tx.send(());
                        },
                    );
                    handle.submit(spec).unwrap();
                }
            })
        })
        .collect();
    for submitter in submitters {
        submitter.join().unwrap();
    }

    for _ in 0..100 {
        done_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    }
    let stats = control.join().unwrap();
    assert_eq!(delivered.load(Ordering::SeqCst), 100);
    assert_eq!(stats.completed, 100);
    assert!(stats.peak_running <= 3);
}

#[test]
fn test_handle_cancel_reaches_running_body() {
    let control = LoomThread::spawn(LoomConfig::with_max_threads(1)).unwrap();
    let (started_tx, started_rx) = channel::bounded(1);
    let (done_tx, done_rx) = channel::bounded(1);

    control
        .handle()
        .submit(TaskSpec::builder("long-parse").build(
            started_tx,
            |started, token| {
                let _ = started.send(());
                Ok(token.sleep(Duration::from_secs(10)))
            },
            move |_, result: Result<bool, TaskError>| {
                let _ = done_tx.send(result.map_err(|e| e.to_string()));
            },
        ))
        .unwrap();

    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    control.handle().cancel("long-parse").unwrap();
    // The body saw the cancellation and returned normally.
    assert_eq!(done_rx.recv_timeout(Duration::from_secs(5)).unwrap(), Ok(true));
}

#[test]
fn test_handle_after_shutdown_is_closed() {
    let loom = Loom::with_capacity(1).unwrap();
    let handle = loom.handle();
    let stats = loom.shutdown();
    assert_eq!(stats.submitted, 0);

    let spec = TaskSpec::builder("late").build((), |_: &(), _| Ok(()), |_: &(), _: Result<(), TaskError>| {});
    assert!(handle.submit(spec).is_err());
}

#[test]
fn test_default_handle_is_shared() {
    let first = default_handle().unwrap();
    let second = default_handle().unwrap();
    assert!(std::ptr::eq(first, second));

    let (tx, rx) = channel::bounded(1);
    first
        .submit(TaskSpec::builder("default-loom").build(
            (),
            |_: &(), _| Ok("ran"),
            move |_: &(), result: Result<&'static str, TaskError>| {
                let _ = tx.send(result.map_err(|e| e.to_string()));
            },
        ))
        .unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Ok("ran"));
}
