//! Byte-forwarding workers
//!
//! One thread per direction copies raw bytes between a session endpoint and
//! a local descriptor. The main loop only sees [`ForwardingWorker`]: whether
//! the worker is done, and a way to stop it.

use std::io::{self, Read, Write};
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use nix::errno::Errno;
use nix::unistd::read;
use tracing::{debug, warn};

use super::wakeup::{Wake, WakeupError, WakeupSignal};

const BUFFER_SIZE: usize = 64 * 1024;

/// What the main loop needs from a forwarding worker
pub trait ForwardingWorker {
    /// True once the worker has stopped forwarding for good
    fn is_complete(&self) -> bool;

    /// Stop the worker and wait for its thread
    fn shutdown(&mut self);
}

/// Completion flag shared between a worker thread and its owner. Marking
/// it complete also wakes the main loop.
#[derive(Clone)]
struct Completion {
    done: Arc<AtomicBool>,
    wakeup: Arc<WakeupSignal>,
}

impl Completion {
    fn new(wakeup: Arc<WakeupSignal>) -> Self {
        Self {
            done: Arc::new(AtomicBool::new(false)),
            wakeup,
        }
    }

    fn finish(&self) {
        self.done.store(true, Ordering::SeqCst);
        self.wakeup.set();
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }
}

fn join(name: &str, thread: &mut Option<JoinHandle<()>>) {
    if let Some(handle) = thread.take() {
        if handle.join().is_err() {
            warn!("{} worker panicked", name);
        }
    }
}

/// Local input descriptor -> session input endpoint
pub struct InputWorker {
    completion: Completion,
    stop: Arc<WakeupSignal>,
    thread: Option<JoinHandle<()>>,
}

impl InputWorker {
    pub fn spawn<F>(
        source: F,
        sink: Box<dyn Write + Send>,
        wakeup: Arc<WakeupSignal>,
    ) -> Result<Self, WakeupError>
    where
        F: AsFd + Send + 'static,
    {
        let completion = Completion::new(wakeup);
        let stop = Arc::new(WakeupSignal::new()?);

        let thread = {
            let completion = completion.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                forward_input(source, sink, &stop);
                completion.finish();
            })
        };

        Ok(Self {
            completion,
            stop,
            thread: Some(thread),
        })
    }
}

impl ForwardingWorker for InputWorker {
    fn is_complete(&self) -> bool {
        self.completion.is_done()
    }

    fn shutdown(&mut self) {
        self.stop.set();
        join("input", &mut self.thread);
    }
}

fn forward_input<F: AsFd>(source: F, mut sink: Box<dyn Write + Send>, stop: &WakeupSignal) {
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        match stop.wait_or_readable(source.as_fd()) {
            Ok(Wake::Readable) => {}
            Ok(Wake::Signalled) => {
                debug!("input worker stopping");
                return;
            }
            Err(e) => {
                warn!("input poll failed: {}", e);
                return;
            }
        }

        match read(source.as_fd(), &mut buf) {
            Ok(0) => {
                debug!("input reached EOF");
                return;
            }
            Ok(n) => {
                if let Err(e) = sink.write_all(&buf[..n]).and_then(|_| sink.flush()) {
                    debug!("session input closed: {}", e);
                    return;
                }
            }
            Err(Errno::EINTR) => continue,
            Err(e) => {
                debug!("input read failed: {}", e);
                return;
            }
        }
    }
}

/// Session output (or error) endpoint -> local writer
pub struct OutputWorker {
    name: &'static str,
    completion: Completion,
    thread: Option<JoinHandle<()>>,
}

impl OutputWorker {
    pub fn spawn<W>(
        name: &'static str,
        source: Box<dyn Read + Send>,
        sink: W,
        wakeup: Arc<WakeupSignal>,
    ) -> Self
    where
        W: Write + Send + 'static,
    {
        let completion = Completion::new(wakeup);
        let thread = {
            let completion = completion.clone();
            thread::spawn(move || {
                forward_output(name, source, sink);
                completion.finish();
            })
        };

        Self {
            name,
            completion,
            thread: Some(thread),
        }
    }
}

impl ForwardingWorker for OutputWorker {
    fn is_complete(&self) -> bool {
        self.completion.is_done()
    }

    /// Relies on the session having been freed: the thread ends when its
    /// endpoint reaches end-of-stream.
    fn shutdown(&mut self) {
        join(self.name, &mut self.thread);
    }
}

fn forward_output<W: Write>(name: &str, mut source: Box<dyn Read + Send>, mut sink: W) {
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        match source.read(&mut buf) {
            Ok(0) => {
                debug!("{} reached EOF", name);
                return;
            }
            Ok(n) => {
                if let Err(e) = sink.write_all(&buf[..n]).and_then(|_| sink.flush()) {
                    debug!("{} write failed: {}", name, e);
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("{} read failed: {}", name, e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct ClosedSink;

    impl Write for ClosedSink {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::BrokenPipe))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_input_forwards_until_eof() {
        let wakeup = Arc::new(WakeupSignal::new().unwrap());
        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        let sink = SharedSink::default();

        let mut worker =
            InputWorker::spawn(read_end, Box::new(sink.clone()), wakeup.clone()).unwrap();

        nix::unistd::write(&write_end, b"hello\x03").unwrap();
        wait_until(|| sink.0.lock().unwrap().len() == 6);
        assert!(!worker.is_complete());

        drop(write_end);
        wakeup.wait().unwrap();
        wait_until(|| worker.is_complete());
        worker.shutdown();

        assert_eq!(sink.0.lock().unwrap().as_slice(), b"hello\x03");
    }

    #[test]
    fn test_input_shutdown_while_idle() {
        let wakeup = Arc::new(WakeupSignal::new().unwrap());
        let (read_end, _write_end) = nix::unistd::pipe().unwrap();

        let mut worker =
            InputWorker::spawn(read_end, Box::new(SharedSink::default()), wakeup).unwrap();
        assert!(!worker.is_complete());

        worker.shutdown();
        assert!(worker.is_complete());
        // Second shutdown is a no-op
        worker.shutdown();
    }

    #[test]
    fn test_input_completes_when_session_input_closes() {
        let wakeup = Arc::new(WakeupSignal::new().unwrap());
        let (read_end, write_end) = nix::unistd::pipe().unwrap();

        let mut worker = InputWorker::spawn(read_end, Box::new(ClosedSink), wakeup).unwrap();
        nix::unistd::write(&write_end, b"x").unwrap();
        wait_until(|| worker.is_complete());
        worker.shutdown();
    }

    #[test]
    fn test_output_forwards_and_wakes_main_loop() {
        let wakeup = Arc::new(WakeupSignal::new().unwrap());
        let sink = SharedSink::default();
        let source = Box::new(Cursor::new(b"\x1b[1mbold\x1b[0m\r\n".to_vec()));

        let mut worker = OutputWorker::spawn("output", source, sink.clone(), wakeup.clone());
        wakeup.wait().unwrap();
        worker.shutdown();

        assert!(worker.is_complete());
        assert_eq!(sink.0.lock().unwrap().as_slice(), b"\x1b[1mbold\x1b[0m\r\n");
    }

    #[test]
    fn test_output_completes_on_write_failure() {
        let wakeup = Arc::new(WakeupSignal::new().unwrap());
        let source = Box::new(Cursor::new(vec![b'x'; 16]));

        let mut worker = OutputWorker::spawn("error", source, ClosedSink, wakeup);
        worker.shutdown();
        assert!(worker.is_complete());
    }
}
