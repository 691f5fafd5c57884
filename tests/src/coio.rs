use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use filament::coio::{self, CoIoFlags, CoIoListener, CoIoStream};
use filament::fiber;

/// A fiber blocked reading from a pipe is resumed when data arrives.
#[filament::test]
fn pipe_read_resumes_on_data() {
    let (reader_end, mut writer_end) = UnixStream::pair().unwrap();

    let reader = fiber::start(move || {
        let mut stream = CoIoStream::new(reader_end).unwrap();
        let mut buf = [0u8; 4];
        let n = stream.read_with_timeout(&mut buf, None).unwrap();
        (n, buf)
    });

    // The reader parks in the event loop before the bytes show up.
    assert!(fiber::sleep(Duration::from_millis(10)));
    writer_end.write_all(b"ping").unwrap();

    let (n, buf) = reader.join().unwrap();
    assert_eq!(n, 4);
    assert_eq!(&buf, b"ping");
}

/// `wait` with a timeout and no readiness reports an empty event set.
#[filament::test]
fn wait_times_out() {
    let (silent, _keep_alive) = UnixStream::pair().unwrap();
    silent.set_nonblocking(true).unwrap();

    let before = Instant::now();
    let flags = coio::wait(
        silent.as_raw_fd(),
        CoIoFlags::READ,
        Some(Duration::from_millis(20)),
    )
    .unwrap();
    assert!(flags.is_empty());
    assert!(before.elapsed() >= Duration::from_millis(20));
}

/// `read_with_timeout` returns 0 when no data arrives in time.
#[filament::test]
fn read_times_out_with_zero() {
    let (reader_end, _writer_end) = UnixStream::pair().unwrap();
    let mut stream = CoIoStream::new(reader_end).unwrap();
    let mut buf = [0u8; 8];
    let n = stream
        .read_with_timeout(&mut buf, Some(Duration::from_millis(10)))
        .unwrap();
    assert_eq!(n, 0);
}

/// Full echo round trip over TCP with both sides running as fibers.
#[filament::test]
fn tcp_echo_round_trip() {
    let listener = CoIoListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = fiber::start_proc(move || {
        let mut conn = listener.accept().unwrap();
        let mut buf = [0u8; 5];
        let n = conn.read_with_timeout(&mut buf, None).unwrap();
        conn.write_with_timeout(&buf[..n], None).unwrap();
    });

    let mut client = CoIoStream::connect(addr).unwrap();
    client.write_with_timeout(b"hello", None).unwrap();
    let mut buf = [0u8; 5];
    let mut got = 0;
    while got < buf.len() {
        let n = client.read_with_timeout(&mut buf[got..], None).unwrap();
        assert!(n > 0);
        got += n;
    }
    assert_eq!(&buf, b"hello");
    assert!(server.join());
}

/// Cancellation interrupts a blocked I/O wait with an error.
#[filament::test]
fn cancel_interrupts_wait() {
    let (reader_end, _writer_end) = UnixStream::pair().unwrap();

    let waiter = fiber::start(move || {
        reader_end.set_nonblocking(true).unwrap();
        coio::wait(reader_end.as_raw_fd(), CoIoFlags::READ, None)
    });
    let handle = waiter.fiber();

    assert!(fiber::sleep(Duration::from_millis(5)));
    fiber::cancel(&handle);
    let res = waiter.join().unwrap();
    assert!(matches!(res, Err(filament::error::Error::Cancelled)));
}
