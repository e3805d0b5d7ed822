use std::sync::{Arc, Mutex, PoisonError};

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};

/// One-shot broadcast. Once triggered, every clone of the receiver observes it, now and forever.
///
/// Nothing is ever sent on the channel. Triggering drops the only sender, which disconnects
/// every receiver at once.
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: Arc<Mutex<Option<Sender<()>>>>,
    receiver: Receiver<()>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (sender, receiver) = bounded(0);

        Self {
            sender: Arc::new(Mutex::new(Some(sender))),
            receiver,
        }
    }

    /// Idempotent
    pub fn trigger(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn is_triggered(&self) -> bool {
        matches!(self.receiver.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// For use in `select!`. Becomes ready (with an error) once triggered.
    pub fn receiver(&self) -> &Receiver<()> {
        &self.receiver
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[test]
fn test_trigger_reaches_every_waiter() {
    use std::thread;
    use std::time::Duration;

    let signal = ShutdownSignal::new();
    assert!(!signal.is_triggered());

    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let signal = signal.clone();
            thread::spawn(move || signal.receiver().recv().is_err())
        })
        .collect();

    thread::sleep(Duration::from_millis(50));
    signal.trigger();
    signal.trigger();

    for waiter in waiters {
        assert!(waiter.join().unwrap());
    }
    assert!(signal.is_triggered());
    assert!(signal.clone().is_triggered());
}
