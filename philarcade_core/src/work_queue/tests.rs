use super::{WorkHandler, WorkQueue};
use flume::{Receiver, Sender};
use std::time::{Duration, Instant};

enum Job {
    Record(u32),
    Wait(Receiver<()>),
    Fail,
}

struct Recorder {
    done: Sender<u32>,
}

impl WorkHandler<Job> for Recorder {
    fn handle(&mut self, item: Job) {
        match item {
            Job::Record(value) => {
                let _ = self.done.send(value);
            },
            Job::Wait(gate) => {
                let _ = gate.recv();
            },
            Job::Fail => panic!("handler failed"),
        }
    }
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for worker");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn work_queue_should_handle_items_in_push_order() {

    let (done, results) = flume::unbounded();
    let queue = WorkQueue::new("test worker", Recorder { done }).unwrap();

    for value in 0..10 {
        queue.push(Job::Record(value));
    }

    let received: Vec<u32> = (0..10)
        .map(|_| results.recv_timeout(Duration::from_secs(5)).unwrap())
        .collect();
    assert_eq!(received, (0..10).collect::<Vec<_>>());
}

#[test]
fn work_queue_reset_should_drop_unstarted_items() {

    // Given a worker stuck on its first item.
    let (done, results) = flume::unbounded();
    let queue = WorkQueue::new("test worker", Recorder { done }).unwrap();
    let (release, gate) = flume::bounded(1);
    queue.push(Job::Wait(gate));
    wait_until(|| queue.pending() == 0);

    queue.push(Job::Record(1));
    queue.push(Job::Record(2));
    assert_eq!(queue.pending(), 2);
    queue.reset();
    assert_eq!(queue.pending(), 0);

    release.send(()).unwrap();
    queue.push(Job::Record(3));

    assert_eq!(results.recv_timeout(Duration::from_secs(5)).unwrap(), 3);
    wait_until(|| !queue.busy());
    assert!(results.try_recv().is_err());
}

#[test]
fn work_queue_drop_should_join_the_worker() {

    let (done, results) = flume::unbounded();
    let queue = WorkQueue::new("test worker", Recorder { done }).unwrap();
    queue.push(Job::Record(7));
    wait_until(|| !results.is_empty());

    drop(queue);

    // The handler, and with it the sender, went away with the thread.
    assert_eq!(results.recv().unwrap(), 7);
    assert!(results.recv().is_err());
}

#[test]
fn work_queue_should_stay_busy_from_push_until_the_item_is_handled() {

    // Given a worker that will block on its item.
    let (done, _results) = flume::unbounded();
    let queue = WorkQueue::new("test worker", Recorder { done }).unwrap();
    let (release, gate) = flume::bounded(1);

    queue.push(Job::Wait(gate));

    // Busy before the worker has even picked it up.
    assert!(queue.busy());
    wait_until(|| queue.pending() == 0);
    assert!(queue.busy());

    release.send(()).unwrap();
    wait_until(|| !queue.busy());
    assert_eq!(queue.pending(), 0);
}

#[test]
fn work_queue_should_drop_items_once_the_worker_has_died() {

    // Given a handler that panics on its first item.
    let (done, results) = flume::unbounded();
    let queue = WorkQueue::new("test worker", Recorder { done }).unwrap();
    queue.push(Job::Fail);
    wait_until(|| !queue.is_alive());

    assert!(!queue.busy());
    queue.push(Job::Record(1));
    assert!(!queue.busy());
    assert!(results.recv_timeout(Duration::from_millis(50)).is_err());
}
