//! Integration tests for the USB data link
//!
//! Every scenario runs against the in-memory driver. Blocking calls
//! (`connect`, `flush`, `close`) run on helper threads while the test thread
//! plays the device by completing transfers.
//!
//! # Test Scenarios
//! - Bind and connect lifecycle, including every connect failure path
//! - Handshake gating of early bytes
//! - Round-trip framing between two links
//! - Device removal, peer disconnect and protocol violations
//! - Write-after-shutdown, flush semantics, drain-before-free teardown
//!
//! Run with: `cargo test -p link --test link_tests`

use bytes::BytesMut;
use common::UsbAddress;
use link::{
    Channels, ConnectError, DriverError, LinkConfig, LinkError, LinkEvent, LinkState,
    MockDriver, RecordingSink, TransferStatus, UsbDataLink,
};
use proptest::prelude::*;
use protocol::{ACCEPT_TOKEN, CONNECT_TOKEN, FrameKind, HEADER_SIZE, REJECT_TOKEN, encode_frame};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

// ============================================================================
// Test Utilities
// ============================================================================

const WAIT: Duration = Duration::from_secs(5);
const CAPACITY: usize = 64;

struct Harness {
    driver: Arc<MockDriver>,
    sink: Arc<RecordingSink>,
    link: Arc<UsbDataLink<MockDriver>>,
}

fn address() -> UsbAddress {
    UsbAddress::new(0x1234, 0x5678)
}

fn config() -> LinkConfig {
    LinkConfig::default().with_scratch_capacity(CAPACITY)
}

fn harness_with(config: LinkConfig) -> Harness {
    let driver = Arc::new(MockDriver::new());
    let sink = Arc::new(RecordingSink::new());
    let link = UsbDataLink::new(driver.clone(), config, sink.clone()).expect("valid config");
    Harness {
        driver,
        sink,
        link: Arc::new(link),
    }
}

fn harness() -> Harness {
    harness_with(config())
}

fn bound() -> Harness {
    let h = harness();
    h.link.bind(&address()).expect("bind failed");
    h
}

fn spawn_connect(h: &Harness) -> thread::JoinHandle<link::Result<()>> {
    let link = h.link.clone();
    thread::spawn(move || link.connect(&address()))
}

/// Move every pending write of `from` into the pending read of `to`
fn pump(from: &MockDriver, to: &MockDriver) -> usize {
    let mut transfers = 0;
    while let Some(bytes) = from.complete_write() {
        assert!(bytes.len() <= CAPACITY, "transfer exceeds scratch capacity");
        assert!(to.complete_read(&bytes), "peer had no read pending");
        transfers += 1;
    }
    transfers
}

/// Poll `ready` until it holds or the test deadline passes
fn wait_until(mut ready: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if ready() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    ready()
}

fn read_all(link: &UsbDataLink<MockDriver>) -> Vec<u8> {
    let mut out = vec![0u8; link.size()];
    let n = link.read(&mut out);
    out.truncate(n);
    out
}

fn disconnect_frame() -> BytesMut {
    let mut wire = BytesMut::new();
    encode_frame(FrameKind::Disconnect, &[], &mut wire).unwrap();
    wire
}

/// Run `connect` until its token is written, acknowledge it, then answer
fn connect_and_answer(h: &Harness, answer: &[&[u8]]) -> link::Result<()> {
    let handle = spawn_connect(h);
    assert!(h.driver.wait_for_write(WAIT));
    h.driver.complete_write().expect("connect token write");
    assert!(h.driver.complete_read_frames(answer));
    handle.join().expect("connect thread panicked")
}

// ============================================================================
// Lifecycle
// ============================================================================

mod lifecycle {
    use super::*;

    #[test]
    fn test_bind_is_connected_without_traffic() {
        let h = bound();

        assert!(h.link.is_connected());
        assert!(h.link.is_accepted());
        assert_eq!(h.link.state(), LinkState::Connected(Channels::OPEN));
        assert_eq!(h.driver.opens(), 1);
        assert_eq!(h.driver.allocated(), 2);
        assert_eq!(h.driver.submitted_writes(), 0);
        assert!(h.driver.has_pending_read());
        assert!(h.sink.events().is_empty());
    }

    #[test]
    fn test_bind_twice_is_already_open() {
        let h = bound();
        assert_eq!(h.link.bind(&address()), Err(LinkError::AlreadyOpen));
        assert_eq!(h.driver.opens(), 1);
    }

    #[test]
    fn test_connect_waits_for_accept() {
        let h = harness();
        let handle = spawn_connect(&h);

        assert!(h.driver.wait_for_write(WAIT));
        assert!(!h.link.is_connected());
        assert!(!h.link.is_accepted());
        assert!(h.sink.events().is_empty());

        h.driver.complete_write().unwrap();
        assert_eq!(
            h.driver.written_frames(),
            vec![(FrameKind::Normal, CONNECT_TOKEN.to_vec())]
        );

        assert!(h.driver.complete_read_frames(&[ACCEPT_TOKEN]));
        handle.join().unwrap().expect("connect failed");

        assert!(h.link.is_connected());
        assert_eq!(h.sink.count(LinkEvent::Connected), 1);
        assert_eq!(h.link.size(), 0);
    }

    #[test]
    fn test_connect_rejected_releases_everything() {
        let h = harness();
        let result = connect_and_answer(&h, &[REJECT_TOKEN]);

        assert_eq!(
            result,
            Err(LinkError::ConnectFailed(ConnectError::Rejected))
        );
        assert_eq!(h.link.state(), LinkState::Closed);
        assert_eq!(h.driver.freed(), 2);
        assert_eq!(h.driver.closes(), 1);
        assert_eq!(h.sink.count(LinkEvent::Connected), 0);
        assert_eq!(h.sink.count(LinkEvent::Disconnected), 0);
    }

    #[test]
    fn test_connect_open_failure() {
        let h = harness();
        h.driver.fail_open(DriverError::NotFound);

        let result = h.link.connect(&address());
        assert_eq!(
            result,
            Err(LinkError::ConnectFailed(ConnectError::DeviceOpen(
                DriverError::NotFound
            )))
        );
        assert_eq!(h.driver.allocated(), 0);
        assert!(!h.link.is_connected());
    }

    #[test]
    fn test_connect_allocation_failure_closes_device() {
        let h = harness();
        h.driver.limit_allocations(1);

        let result = h.link.connect(&address());
        assert_eq!(
            result,
            Err(LinkError::ConnectFailed(ConnectError::Allocation(
                DriverError::Allocation
            )))
        );
        assert_eq!(h.driver.allocated(), 1);
        assert_eq!(h.driver.freed(), 1);
        assert_eq!(h.driver.closes(), 1);
        assert!(!h.driver.is_open());
    }

    #[test]
    fn test_bind_submit_failure_releases_everything() {
        let h = harness();
        h.driver.fail_submissions(DriverError::Io);

        let result = h.link.bind(&address());
        assert_eq!(
            result,
            Err(LinkError::ConnectFailed(ConnectError::Submit(DriverError::Io)))
        );
        assert_eq!(h.link.state(), LinkState::Closed);
        assert_eq!(h.driver.freed(), 2);
        assert_eq!(h.driver.closes(), 1);
    }

    #[test]
    fn test_handshake_timeout() {
        let h = harness_with(config().with_handshake_timeout(Duration::from_millis(50)));

        let result = h.link.connect(&address());
        assert_eq!(
            result,
            Err(LinkError::ConnectFailed(ConnectError::HandshakeTimeout(
                Duration::from_millis(50)
            )))
        );
        assert_eq!(h.driver.freed(), 2);
        assert!(!h.driver.is_open());
    }

    #[test]
    fn test_close_aborts_pending_connect() {
        let h = harness();
        let handle = spawn_connect(&h);
        assert!(h.driver.wait_for_write(WAIT));

        h.link.close();

        let result = handle.join().unwrap();
        assert_eq!(result, Err(LinkError::ConnectFailed(ConnectError::Aborted)));
        assert_eq!(h.link.state(), LinkState::Closed);
        assert_eq!(h.driver.freed(), 2);
        assert_eq!(h.driver.closes(), 1);
    }

    #[test]
    fn test_close_sends_disconnect_and_is_idempotent() {
        let h = bound();

        let link = h.link.clone();
        let closer = thread::spawn(move || link.close());
        assert!(h.driver.wait_for_write(WAIT));
        h.driver.complete_write().unwrap();
        closer.join().unwrap();

        assert_eq!(
            h.driver.written_frames(),
            vec![(FrameKind::Disconnect, Vec::new())]
        );
        assert_eq!(h.sink.count(LinkEvent::Disconnected), 1);
        assert_eq!(h.link.state(), LinkState::Closed);
        assert_eq!(h.driver.freed(), 2);

        h.link.close();
        h.link.close();
        assert_eq!(h.sink.count(LinkEvent::Disconnected), 1);
        assert_eq!(h.driver.closes(), 1);
    }

    #[test]
    fn test_close_drops_queued_output_behind_in_flight_write() {
        let h = harness_with(LinkConfig::default().with_scratch_capacity(HEADER_SIZE + 4));
        h.link.bind(&address()).unwrap();

        // First frame goes out at once, the second waits behind it
        h.link.write(b"sentqued");
        assert!(h.driver.has_pending_write());

        let link = h.link.clone();
        let closer = thread::spawn(move || link.close());
        assert!(wait_until(|| matches!(h.link.state(), LinkState::Closing(_))));

        // In-flight frame, then the disconnect frame
        h.driver.complete_write().unwrap();
        assert!(h.driver.wait_for_write(WAIT));
        h.driver.complete_write().unwrap();
        closer.join().unwrap();

        assert_eq!(
            h.driver.written_frames(),
            vec![
                (FrameKind::Normal, b"sent".to_vec()),
                (FrameKind::Disconnect, Vec::new())
            ]
        );
    }

    #[test]
    fn test_drop_releases_without_disconnect_frame() {
        let h = bound();
        let Harness { driver, sink, link } = h;
        drop(link);

        assert_eq!(driver.closes(), 1);
        assert_eq!(driver.freed(), 2);
        assert_eq!(driver.submitted_writes(), 0);
        assert_eq!(sink.count(LinkEvent::Disconnected), 1);
    }

    #[test]
    fn test_connect_after_close_reopens() {
        let h = bound();
        let link = h.link.clone();
        let closer = thread::spawn(move || link.close());
        assert!(h.driver.wait_for_write(WAIT));
        h.driver.complete_write().unwrap();
        closer.join().unwrap();

        connect_and_answer(&h, &[ACCEPT_TOKEN]).expect("reconnect failed");
        assert!(h.link.is_connected());
        assert_eq!(h.driver.opens(), 2);
    }

    #[test]
    fn test_invalid_config_is_refused() {
        let driver = Arc::new(MockDriver::new());
        let result = UsbDataLink::new(
            driver,
            LinkConfig::default().with_scratch_capacity(HEADER_SIZE),
            Arc::new(RecordingSink::new()),
        );
        assert!(matches!(result, Err(LinkError::InvalidConfig(_))));
    }

    #[test]
    fn test_zero_handshake_timeout_is_refused() {
        let mut config = config();
        config.handshake_timeout_ms = Some(0);
        let result = UsbDataLink::new(
            Arc::new(MockDriver::new()),
            config,
            Arc::new(RecordingSink::new()),
        );
        assert!(matches!(result, Err(LinkError::InvalidConfig(_))));
    }
}

// ============================================================================
// Handshake Gating
// ============================================================================

mod handshake {
    use super::*;

    #[test]
    fn test_bytes_before_accept_never_surface() {
        let h = harness();
        connect_and_answer(&h, &[b"", ACCEPT_TOKEN, b"payload"]).expect("connect failed");

        assert_eq!(read_all(&h.link), b"payload");
        assert_eq!(h.sink.count(LinkEvent::InputReady), 1);
    }

    #[test]
    fn test_unknown_answer_rejects() {
        let h = harness();
        let result = connect_and_answer(&h, &[b"HELLO"]);

        assert_eq!(
            result,
            Err(LinkError::ConnectFailed(ConnectError::Rejected))
        );
        assert_eq!(h.link.size(), 0);
    }

    #[test]
    fn test_disconnect_before_answer_rejects() {
        let h = harness();
        let handle = spawn_connect(&h);
        assert!(h.driver.wait_for_write(WAIT));
        h.driver.complete_write().unwrap();
        assert!(h.driver.complete_read(&disconnect_frame()));

        assert_eq!(
            handle.join().unwrap(),
            Err(LinkError::ConnectFailed(ConnectError::Rejected))
        );
    }

    #[test]
    fn test_reply_handshake_between_links() {
        let client = harness();
        let server = bound();

        let handle = spawn_connect(&client);
        assert!(client.driver.wait_for_write(WAIT));
        assert_eq!(pump(&client.driver, &server.driver), 1);

        assert_eq!(read_all(&server.link), CONNECT_TOKEN);
        server.link.reply_handshake(true);
        assert_eq!(pump(&server.driver, &client.driver), 1);

        handle.join().unwrap().expect("connect failed");
        assert!(client.link.is_connected());

        client.link.write(b"ping");
        pump(&client.driver, &server.driver);
        assert_eq!(read_all(&server.link), b"ping");
    }
}

// ============================================================================
// Round-Trip Framing
// ============================================================================

mod framing {
    use super::*;

    fn pair() -> (Harness, Harness) {
        (bound(), bound())
    }

    #[test]
    fn test_consecutive_writes_read_back_concatenated() {
        let (a, b) = pair();
        a.link.write(b"first ");
        a.link.write(b"second");
        pump(&a.driver, &b.driver);

        assert_eq!(read_all(&b.link), b"first second");
        assert_eq!(a.link.pending_output(), 0);
    }

    #[test]
    fn test_empty_write_is_noop() {
        let (a, _b) = pair();
        a.link.write(b"");
        assert_eq!(a.driver.submitted_writes(), 0);
        assert_eq!(a.link.pending_output(), 0);
        assert!(a.sink.events().is_empty());
    }

    #[test]
    fn test_capacity_sized_payload() {
        let (a, b) = pair();
        let payload: Vec<u8> = (0..CAPACITY as u8).collect();
        a.link.write(&payload);

        assert_eq!(pump(&a.driver, &b.driver), 2);
        assert_eq!(read_all(&b.link), payload);
    }

    #[test]
    fn test_large_payload_is_split_across_transfers() {
        let (a, b) = pair();
        let payload: Vec<u8> = (0..5 * CAPACITY).map(|i| (i % 251) as u8).collect();
        a.link.write(&payload);

        assert!(pump(&a.driver, &b.driver) >= 5);
        assert_eq!(read_all(&b.link), payload);
    }

    #[test]
    fn test_partial_reads_and_discard() {
        let (a, b) = pair();
        a.link.write(b"0123456789");
        pump(&a.driver, &b.driver);

        let mut buf = [0u8; 4];
        assert_eq!(b.link.read(&mut buf), 4);
        assert_eq!(&buf, b"0123");
        assert_eq!(b.link.discard(3), 3);
        assert_eq!(b.link.size(), 3);
        assert!(b.link.is_ready());
        assert_eq!(read_all(&b.link), b"789");
        assert!(!b.link.is_ready());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_round_trip(payloads in prop::collection::vec(
            prop::collection::vec(any::<u8>(), 0..3 * CAPACITY),
            1..5,
        )) {
            let (a, b) = pair();
            for payload in &payloads {
                a.link.write(payload);
            }
            pump(&a.driver, &b.driver);

            let expected: Vec<u8> = payloads.concat();
            prop_assert_eq!(read_all(&b.link), expected);
        }
    }
}

// ============================================================================
// Disconnection
// ============================================================================

mod disconnect {
    use super::*;

    #[test]
    fn test_device_removed_on_both_paths_emits_once() {
        let h = bound();
        h.link.write(b"x");
        assert!(h.driver.has_pending_write());

        let reader = {
            let driver = h.driver.clone();
            thread::spawn(move || driver.fail_read(TransferStatus::NoDevice))
        };
        let writer = {
            let driver = h.driver.clone();
            thread::spawn(move || driver.fail_write(TransferStatus::NoDevice))
        };
        reader.join().unwrap();
        writer.join().unwrap();

        assert_eq!(h.sink.count(LinkEvent::Disconnected), 1);
        assert_eq!(h.link.state(), LinkState::Disconnected);

        h.link.close();
        assert_eq!(h.sink.count(LinkEvent::Disconnected), 1);
        assert_eq!(h.driver.freed(), 2);
    }

    /// Bound link holding unread input with one write in flight
    fn loaded() -> Harness {
        let h = bound();
        assert!(h.driver.complete_read_frames(&[b"unread"]));
        assert!(h.driver.wait_for_read(WAIT));
        h.link.write(b"x");
        assert!(h.driver.has_pending_write());
        h
    }

    #[test]
    fn test_device_removed_on_both_paths_drops_unread_input() {
        let h = loaded();
        let reader = {
            let driver = h.driver.clone();
            thread::spawn(move || driver.fail_read(TransferStatus::NoDevice))
        };
        let writer = {
            let driver = h.driver.clone();
            thread::spawn(move || driver.fail_write(TransferStatus::NoDevice))
        };
        reader.join().unwrap();
        writer.join().unwrap();

        assert!(wait_until(|| h.link.state() == LinkState::Disconnected));
        assert_eq!(h.link.size(), 0);
        assert_eq!(h.sink.count(LinkEvent::InputShutdown), 1);
        assert_eq!(h.sink.count(LinkEvent::OutputShutdown), 1);
        assert_eq!(h.sink.count(LinkEvent::Disconnected), 1);
    }

    #[test]
    fn test_write_device_loss_after_read_loss_disconnects() {
        let h = loaded();
        assert!(h.driver.fail_read(TransferStatus::NoDevice));
        assert_eq!(h.link.size(), 6);
        assert!(h.link.is_connected());

        assert!(h.driver.fail_write(TransferStatus::NoDevice));

        assert_eq!(h.link.state(), LinkState::Disconnected);
        assert_eq!(h.link.size(), 0);
        assert_eq!(
            h.sink.events(),
            vec![
                LinkEvent::InputReady,
                LinkEvent::InputShutdown,
                LinkEvent::OutputShutdown,
                LinkEvent::Disconnected
            ]
        );
    }

    #[test]
    fn test_read_device_loss_after_write_loss_is_quiet() {
        let h = loaded();
        h.driver.defer_cancellation(true);

        assert!(h.driver.fail_write(TransferStatus::NoDevice));
        assert_eq!(h.link.state(), LinkState::Disconnected);
        assert!(h.driver.wait_for_cancel(WAIT));

        assert_eq!(h.driver.fail_cancelled(TransferStatus::NoDevice), 1);
        assert_eq!(
            h.sink.events(),
            vec![
                LinkEvent::InputReady,
                LinkEvent::InputShutdown,
                LinkEvent::OutputShutdown,
                LinkEvent::Disconnected
            ]
        );

        h.link.close();
        assert_eq!(h.sink.count(LinkEvent::Disconnected), 1);
        assert_eq!(h.driver.freed(), 2);
    }

    #[test]
    fn test_read_device_loss_keeps_output_open() {
        let h = bound();
        assert!(h.driver.fail_read(TransferStatus::NoDevice));

        assert_eq!(h.sink.events(), vec![LinkEvent::InputShutdown]);
        assert_eq!(
            h.link.state(),
            LinkState::Connected(Channels {
                readable: false,
                writable: true
            })
        );
        assert!(!h.driver.has_pending_read());

        h.link.shutdown_output();
        assert_eq!(h.sink.count(LinkEvent::Disconnected), 1);
        assert_eq!(h.link.state(), LinkState::Disconnected);
    }

    #[test]
    fn test_peer_disconnect_frame_keeps_unread_input() {
        let h = bound();
        let mut wire = BytesMut::new();
        encode_frame(FrameKind::Normal, b"tail", &mut wire).unwrap();
        encode_frame(FrameKind::Disconnect, &[], &mut wire).unwrap();
        encode_frame(FrameKind::Normal, b"ignored", &mut wire).unwrap();
        assert!(h.driver.complete_read(&wire));

        assert_eq!(
            h.sink.events(),
            vec![LinkEvent::InputShutdown, LinkEvent::InputReady]
        );
        assert!(!h.driver.has_pending_read());

        h.link.shutdown_output();
        assert!(h.link.is_connected());

        assert_eq!(read_all(&h.link), b"tail");
        assert_eq!(h.sink.count(LinkEvent::Disconnected), 1);
        assert!(!h.link.is_connected());
    }

    #[test]
    fn test_protocol_violation_tears_down() {
        let h = bound();
        assert!(h.driver.complete_read(&[0xff, 0x00, 0x00]));

        assert_eq!(h.link.state(), LinkState::Disconnected);
        assert_eq!(h.sink.count(LinkEvent::Disconnected), 1);
        assert_eq!(h.sink.count(LinkEvent::InputShutdown), 1);
        assert!(!h.driver.has_pending_read());
    }

    #[test]
    fn test_length_overrun_tears_down_and_drops_input() {
        let h = bound();
        let mut wire = BytesMut::new();
        encode_frame(FrameKind::Normal, b"ok", &mut wire).unwrap();
        wire.extend_from_slice(&[0, 0, 0, 0, 100, 0, 0, 0, 1, 2]);
        assert!(h.driver.complete_read(&wire));

        assert_eq!(h.link.state(), LinkState::Disconnected);
        assert_eq!(h.link.size(), 0);
    }

    #[test]
    fn test_shutdown_both_directions_disconnects_once() {
        let h = bound();
        h.link.shutdown_input();
        h.link.shutdown_input();
        h.link.shutdown_output();
        h.link.shutdown_output();

        assert_eq!(
            h.sink.events(),
            vec![
                LinkEvent::InputShutdown,
                LinkEvent::OutputShutdown,
                LinkEvent::Disconnected
            ]
        );
    }
}

// ============================================================================
// Write Path
// ============================================================================

mod write_path {
    use super::*;

    #[test]
    fn test_write_after_shutdown_is_output_error() {
        let h = bound();
        h.link.shutdown_output();
        let before = h.link.pending_output();

        h.link.write(b"dropped");

        assert_eq!(h.link.pending_output(), before);
        assert_eq!(h.sink.count(LinkEvent::OutputError), 1);
        assert_eq!(h.driver.submitted_writes(), 0);
    }

    #[test]
    fn test_write_on_idle_link_is_output_error() {
        let h = harness();
        h.link.write(b"nowhere");
        assert_eq!(h.sink.events(), vec![LinkEvent::OutputError]);
    }

    #[test]
    fn test_short_write_closes_output() {
        let h = bound();
        h.link.write(b"abcdef");
        assert!(h.driver.complete_write_partial(3));

        assert_eq!(
            h.sink.events(),
            vec![LinkEvent::OutputError, LinkEvent::OutputShutdown]
        );
        assert_eq!(
            h.link.state(),
            LinkState::Connected(Channels {
                readable: true,
                writable: false
            })
        );
        assert_eq!(h.link.pending_output(), 0);
    }

    #[test]
    fn test_write_stall_closes_output() {
        let h = bound();
        h.link.write(b"abc");
        assert!(h.driver.fail_write(TransferStatus::Stall));

        assert_eq!(h.sink.count(LinkEvent::OutputError), 1);
        assert!(!h.link.state().accepts_writes());
    }

    #[test]
    fn test_read_timeout_resubmits() {
        let h = bound();
        assert!(h.driver.fail_read(TransferStatus::TimedOut));

        assert!(h.driver.has_pending_read());
        assert_eq!(h.driver.submitted_reads(), 2);
        assert!(h.sink.events().is_empty());
    }
}

// ============================================================================
// Flush
// ============================================================================

mod flush {
    use super::*;

    #[test]
    fn test_flush_returns_when_empty() {
        let h = bound();
        h.link.flush();
    }

    #[test]
    fn test_flush_blocks_until_write_completes() {
        let h = bound();
        h.link.write(b"abc");

        let done = Arc::new(AtomicBool::new(false));
        let flusher = {
            let link = h.link.clone();
            let done = done.clone();
            thread::spawn(move || {
                link.flush();
                done.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!done.load(Ordering::SeqCst));

        h.driver.complete_write().unwrap();
        flusher.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(h.sink.count(LinkEvent::OutputFlushed), 1);
    }

    #[test]
    fn test_shutdown_output_wakes_flush() {
        let h = bound();
        h.link.write(b"abc");

        let flusher = {
            let link = h.link.clone();
            thread::spawn(move || link.flush())
        };
        thread::sleep(Duration::from_millis(20));
        h.link.shutdown_output();
        flusher.join().unwrap();

        // The in-flight write still completes into the drain path
        assert!(h.driver.complete_write().is_some());
        assert_eq!(h.sink.count(LinkEvent::OutputFlushed), 0);
    }
}

// ============================================================================
// Teardown
// ============================================================================

mod teardown {
    use super::*;

    #[test]
    fn test_close_waits_for_cancelled_transfers() {
        let h = bound();
        h.driver.defer_cancellation(true);

        let closer = {
            let link = h.link.clone();
            thread::spawn(move || link.close())
        };

        assert!(h.driver.wait_for_write(WAIT));
        h.driver.complete_write().unwrap();
        assert!(h.driver.wait_for_cancel(WAIT));

        thread::sleep(Duration::from_millis(50));
        assert_eq!(h.driver.freed(), 0);
        assert!(!closer.is_finished());

        assert_eq!(h.driver.deliver_cancellations(), 1);
        closer.join().unwrap();
        assert_eq!(h.driver.freed(), 2);
        assert_eq!(h.driver.closes(), 1);
    }
}

// ============================================================================
// Events
// ============================================================================

mod events {
    use super::*;

    #[test]
    fn test_input_ready_only_on_empty_to_non_empty() {
        let h = bound();
        assert!(h.driver.complete_read_frames(&[b"a"]));
        assert!(h.driver.complete_read_frames(&[b"b"]));
        assert_eq!(h.sink.count(LinkEvent::InputReady), 1);

        assert_eq!(read_all(&h.link), b"ab");
        assert!(h.driver.complete_read_frames(&[b"c"]));
        assert_eq!(h.sink.count(LinkEvent::InputReady), 2);
    }

    #[test]
    fn test_empty_frames_do_not_signal_input() {
        let h = bound();
        assert!(h.driver.complete_read_frames(&[b"", b""]));
        assert!(h.sink.events().is_empty());
        assert!(h.driver.has_pending_read());
    }

    #[test]
    fn test_notifications_name_their_link() {
        let h = bound();
        h.link.shutdown_input();
        h.link.shutdown_output();

        let id = h.link.id();
        let notifications = h.sink.notifications();
        assert_eq!(notifications.len(), 3);
        assert!(notifications.iter().all(|n| n.link == id));
    }

    #[test]
    fn test_channel_sink_receives_events() {
        let driver = Arc::new(MockDriver::new());
        let (tx, rx) = async_channel::unbounded();
        let link = UsbDataLink::new(driver, config(), Arc::new(tx)).unwrap();

        link.bind(&address()).unwrap();
        link.shutdown_input();

        let notification = rx.try_recv().unwrap();
        assert_eq!(notification.event, LinkEvent::InputShutdown);
        assert_eq!(notification.link, link.id());
    }
}
