use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use treesync::host_lock::HostLocker;
use treesync::{CancelToken, Error};

#[test]
fn test_lock_serializes_critical_sections() {
    let td = tempfile::tempdir().expect("tmpdir");
    let locker = HostLocker::new(td.path());
    let cancel = CancelToken::new();

    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let locker2 = locker.clone();
    let holder = thread::spawn(move || {
        let cancel = CancelToken::new();
        locker2
            .with_lock("cache-x", Duration::from_secs(10), &cancel, || {
                entered_tx.send(()).expect("send entered");
                release_rx.recv().expect("recv release");
                Ok(())
            })
            .expect("holder with_lock failed");
    });

    entered_rx.recv().expect("holder never entered");
    let started = Instant::now();
    let release_handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        release_tx.send(()).expect("send release");
    });

    locker
        .with_lock("cache-x", Duration::from_secs(10), &cancel, || Ok(()))
        .expect("second with_lock failed");
    assert!(
        started.elapsed() >= Duration::from_millis(250),
        "second lock did not wait: {:?}",
        started.elapsed()
    );

    holder.join().expect("holder join");
    release_handle.join().expect("release join");
}

#[test]
fn test_lock_timeout() {
    let td = tempfile::tempdir().expect("tmpdir");
    let locker = HostLocker::new(td.path());

    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let locker2 = locker.clone();
    let holder = thread::spawn(move || {
        let cancel = CancelToken::new();
        locker2
            .with_lock("cache-y", Duration::from_secs(10), &cancel, || {
                entered_tx.send(()).expect("send entered");
                release_rx.recv().expect("recv release");
                Ok(())
            })
            .expect("holder with_lock failed");
    });

    entered_rx.recv().expect("holder never entered");
    let cancel = CancelToken::new();
    let err = locker
        .with_lock("cache-y", Duration::from_millis(200), &cancel, || Ok(()))
        .expect_err("lock acquired while held");
    assert!(matches!(err, Error::LockTimeout { .. }), "{err}");

    release_tx.send(()).expect("send release");
    holder.join().expect("holder join");
}

#[test]
fn test_different_names_do_not_contend() {
    let td = tempfile::tempdir().expect("tmpdir");
    let locker = HostLocker::new(td.path());
    let cancel = CancelToken::new();

    locker
        .with_lock("cache-a", Duration::from_secs(10), &cancel, || {
            // Nested acquisition of a different name must not deadlock.
            locker.with_lock("cache-b", Duration::from_millis(500), &cancel, || Ok(()))
        })
        .expect("independent locks contended");
}

#[test]
fn test_lock_wait_observes_cancellation() {
    let td = tempfile::tempdir().expect("tmpdir");
    let locker = HostLocker::new(td.path());

    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let locker2 = locker.clone();
    let holder = thread::spawn(move || {
        let cancel = CancelToken::new();
        locker2
            .with_lock("cache-z", Duration::from_secs(10), &cancel, || {
                entered_tx.send(()).expect("send entered");
                release_rx.recv().expect("recv release");
                Ok(())
            })
            .expect("holder with_lock failed");
    });

    entered_rx.recv().expect("holder never entered");
    let cancel = CancelToken::new();
    let waiter_cancel = cancel.clone();
    let locker3 = locker.clone();
    let waiter = thread::spawn(move || {
        locker3.with_lock("cache-z", Duration::from_secs(30), &waiter_cancel, || Ok(()))
    });

    thread::sleep(Duration::from_millis(150));
    cancel.cancel();
    let result = waiter.join().expect("waiter join");
    assert!(matches!(result, Err(Error::Cancelled)), "{result:?}");

    release_tx.send(()).expect("send release");
    holder.join().expect("holder join");
}
