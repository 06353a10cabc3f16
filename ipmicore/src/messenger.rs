//! Single UDP endpoint shared by every connection. A dedicated reader thread
//! fans each received datagram out to all live subscribers in receive order;
//! demultiplexing by source address and session ID is the subscribers' job.

use ipmiproto::logging::{self, Logger};
use ipmiproto::shared::{IpmiError, IpmiResult};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

/// Largest datagram accepted off the wire.
pub const MAX_DATAGRAM_SIZE: usize = 1024;

/// Receive timeout, bounding how long shutdown waits on the reader.
const READ_TICK: Duration = Duration::from_millis(50);

/// Callback registered for received datagrams. Subscribers are held weakly;
/// a dropped subscriber is pruned on the next delivery round.
pub trait Subscriber: Send + Sync {
    fn deliver(&self, source: SocketAddr, datagram: &[u8]);
}

struct Inner {
    socket: UdpSocket,
    subscribers: Mutex<Vec<Weak<dyn Subscriber>>>,
    closed: AtomicBool,
    log: Logger,
}

/// Owns the UDP socket and its reader thread.
pub struct Messenger {
    inner: Arc<Inner>,
    reader: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Messenger {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> IpmiResult<Messenger> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_read_timeout(Some(READ_TICK))?;

        let inner = Arc::new(Inner {
            socket,
            subscribers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            log: logging::child_or_discard(log.into()),
        });

        let reader_inner = inner.clone();
        let reader = thread::spawn(move || Self::run(reader_inner));

        Ok(Messenger {
            inner,
            reader: Mutex::new(Some(reader)),
        })
    }

    #[inline]
    pub fn local_addr(&self) -> IpmiResult<SocketAddr> {
        self.inner.socket.local_addr().map_err(Into::into)
    }

    /// Best-effort, non-blocking datagram send.
    pub fn send(&self, target: SocketAddr, datagram: &[u8]) -> IpmiResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(IpmiError::TransportClosed);
        }

        logging::trace!(self.inner.log, "sending datagram";
                        "context" => "send",
                        "target" => %target,
                        "size" => datagram.len());

        self.inner.socket.send_to(datagram, target)?;
        Ok(())
    }

    /// Registers a subscriber for received datagrams.
    pub fn subscribe(&self, subscriber: Weak<dyn Subscriber>) {
        self.inner
            .subscribers
            .lock()
            .expect("Subscriber list poisoned")
            .push(subscriber);
    }

    /// Stops the reader thread and fails subsequent sends with
    /// `TransportClosed`. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        logging::debug!(self.inner.log, "closing messenger"; "context" => "close");

        let reader = self
            .reader
            .lock()
            .expect("Reader handle poisoned")
            .take();

        if let Some(reader) = reader {
            drop(reader.join());
        }
    }

    fn run(inner: Arc<Inner>) {
        let mut buffer = [0u8; MAX_DATAGRAM_SIZE];

        while !inner.closed.load(Ordering::SeqCst) {
            match inner.socket.recv_from(&mut buffer) {
                Ok((size, source)) => {
                    logging::trace!(inner.log, "received datagram";
                                    "context" => "receive",
                                    "source" => %source,
                                    "size" => size);

                    let targets: Vec<Arc<dyn Subscriber>> = {
                        let mut subscribers =
                            inner.subscribers.lock().expect("Subscriber list poisoned");

                        subscribers.retain(|entry| entry.strong_count() > 0);
                        subscribers
                            .iter()
                            .filter_map(|entry| entry.upgrade())
                            .collect()
                    };

                    for target in targets {
                        target.deliver(source, &buffer[..size]);
                    }
                }
                Err(error)
                    if error.kind() == io::ErrorKind::WouldBlock
                        || error.kind() == io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(error) => {
                    // Transient receive errors (e.g. ICMP port unreachable
                    // surfacing as a reset) must not kill the reader.
                    if !inner.closed.load(Ordering::SeqCst) {
                        logging::warn!(inner.log, "receive error";
                                       "context" => "receive",
                                       "error" => ?error);
                    }
                }
            }
        }
    }
}

impl Drop for Messenger {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        datagrams: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
    }

    impl Recorder {
        fn new() -> Arc<Recorder> {
            Arc::new(Recorder {
                datagrams: Mutex::new(Vec::new()),
            })
        }

        fn count(&self) -> usize {
            self.datagrams.lock().unwrap().len()
        }
    }

    impl Subscriber for Recorder {
        fn deliver(&self, source: SocketAddr, datagram: &[u8]) {
            self.datagrams
                .lock()
                .unwrap()
                .push((source, datagram.to_vec()));
        }
    }

    fn wait_for<F: Fn() -> bool>(predicate: F) {
        for _ in 0..100 {
            if predicate() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("Condition not reached in time");
    }

    #[test]
    fn test_send_and_receive() {
        let first = Messenger::new(None).unwrap();
        let second = Messenger::new(None).unwrap();

        let recorder = Recorder::new();
        second.subscribe(Arc::downgrade(&recorder) as Weak<dyn Subscriber>);

        let target = SocketAddr::new("127.0.0.1".parse().unwrap(), second.local_addr().unwrap().port());
        first.send(target, &[1, 2, 3]).unwrap();

        wait_for(|| recorder.count() == 1);

        let received = recorder.datagrams.lock().unwrap();
        assert_eq!(received[0].1, vec![1, 2, 3]);
    }

    #[test]
    fn test_all_subscribers_receive() {
        let first = Messenger::new(None).unwrap();
        let second = Messenger::new(None).unwrap();

        let one = Recorder::new();
        let two = Recorder::new();
        second.subscribe(Arc::downgrade(&one) as Weak<dyn Subscriber>);
        second.subscribe(Arc::downgrade(&two) as Weak<dyn Subscriber>);

        let target = SocketAddr::new("127.0.0.1".parse().unwrap(), second.local_addr().unwrap().port());
        first.send(target, &[7]).unwrap();

        wait_for(|| one.count() == 1 && two.count() == 1);
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let first = Messenger::new(None).unwrap();
        let second = Messenger::new(None).unwrap();

        let recorder = Recorder::new();
        second.subscribe(Arc::downgrade(&recorder) as Weak<dyn Subscriber>);
        drop(recorder);

        let target = SocketAddr::new("127.0.0.1".parse().unwrap(), second.local_addr().unwrap().port());
        first.send(target, &[7]).unwrap();

        // Give the reader a moment; nothing to assert beyond not panicking,
        // but the subscriber list must end up empty.
        thread::sleep(Duration::from_millis(100));
        assert!(second.inner.subscribers.lock().unwrap().is_empty());
    }

    #[test]
    fn test_send_after_close_fails() {
        let messenger = Messenger::new(None).unwrap();
        let target = messenger.local_addr().unwrap();

        messenger.close();

        assert_eq!(
            messenger.send(target, &[1]).unwrap_err(),
            IpmiError::TransportClosed
        );
    }

    #[test]
    fn test_close_is_idempotent() {
        let messenger = Messenger::new(None).unwrap();
        messenger.close();
        messenger.close();
    }
}
