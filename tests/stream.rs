//! End-to-end tests: client against the loopback buffer server.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;

use fieldtrip_rs::parse::decode_message_def;
use fieldtrip_rs::prelude::*;
use fieldtrip_rs::protocol::{self, GET_HDR, WAIT_DAT};
use fieldtrip_rs::server::{spawn_loopback, Publisher};

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Interleaved frames where channel `c` of sample `s` is `s*100 + c`,
/// starting at absolute sample `start`.
fn frames(nchans: usize, start: usize, count: usize) -> Vec<f32> {
    (start..start + count)
        .flat_map(|s| (0..nchans).map(move |c| (s * 100 + c) as f32))
        .collect()
}

async fn connect(port: u16, config: RtClientConfig) -> RtSession {
    RtClient::new(RtClientConfig {
        host: "127.0.0.1".into(),
        port,
        ..config
    })
    .connect()
    .await
    .expect("loopback connect")
}

fn names(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("EEG {i:03}")).collect()
}

fn all_eeg() -> Selector {
    Selector {
        eeg: true,
        ..Default::default()
    }
}

// ── Header retrieval ─────────────────────────────────────────────────────────

#[tokio::test]
async fn header_polling_outlasts_a_slow_producer() {
    let (addr, publisher) = spawn_loopback().await.unwrap();
    let mut session = connect(addr.port(), RtClientConfig::default()).await;

    // Producer publishes its header only after the client started polling.
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        publisher.set_header(names(4), 250.0);
    });

    let info = session.get_measurement_info().await.unwrap();
    assert_eq!(info.nchan(), 4);
    assert_eq!(info.sfreq(), 250.0);
    assert_eq!(info.channel_names()[3], "EEG 003");

    // Cached snapshot: the second call returns the same thing immediately.
    let again = session.get_measurement_info().await.unwrap();
    assert_eq!(again.channel_names(), info.channel_names());
}

#[tokio::test]
async fn missing_header_fails_within_wait_max() {
    let (addr, _publisher) = spawn_loopback().await.unwrap();
    let mut session = connect(
        addr.port(),
        RtClientConfig {
            wait_max_secs: 1,
            ..Default::default()
        },
    )
    .await;

    let started = std::time::Instant::now();
    let err = session.get_measurement_info().await.unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn epoch_before_info_is_a_protocol_error() {
    let (addr, publisher) = spawn_loopback().await.unwrap();
    publisher.set_header(names(2), 100.0);
    let mut session = connect(addr.port(), RtClientConfig::default()).await;

    let info = MeasurementInfo::new(names(2), 100.0);
    let picks = select_channels(&info, &all_eeg()).unwrap();
    let err = session.get_epoch(10, &picks).await.unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
}

// ── Epoch retrieval ──────────────────────────────────────────────────────────

#[tokio::test]
async fn epoch_blocks_until_the_window_is_complete() {
    let (addr, publisher) = spawn_loopback().await.unwrap();
    publisher.set_header(names(2), 1000.0);

    let mut session = connect(addr.port(), RtClientConfig::default()).await;
    let info = session.get_measurement_info().await.unwrap();
    let picks = select_channels(&info, &all_eeg()).unwrap();

    // 1000 of the 2048 samples exist: the request must stay pending.
    publisher.append(&frames(2, 0, 1000));
    let pending = session.get_epoch(2048, &picks);
    tokio::pin!(pending);
    assert!(
        timeout(Duration::from_millis(300), &mut pending).await.is_err(),
        "epoch completed with only half the window available"
    );

    // Completing the window releases the caller with exactly 2048 samples.
    publisher.append(&frames(2, 1000, 1100));
    let epoch = timeout(Duration::from_secs(5), &mut pending)
        .await
        .expect("retrieval did not complete after enough samples arrived")
        .unwrap();

    assert_eq!(epoch.n_samples(), 2048);
    assert_eq!(epoch.n_channels(), 2);
    assert_eq!(epoch.start_sample, 2100 - 2048);
    // Most recent window: the last value is sample 2099 of channel 1.
    assert_eq!(epoch.data[1][2047], (2099 * 100 + 1) as f32);
    assert_eq!(epoch.tmax(), 2.1);
}

#[tokio::test]
async fn channel_axis_follows_selection_order() {
    let (addr, publisher) = spawn_loopback().await.unwrap();
    publisher.set_header(
        vec!["MEG 0112".into(), "EEG 001".into(), "EOG 061".into()],
        100.0,
    );

    let mut session = connect(addr.port(), RtClientConfig::default()).await;
    let info = session.get_measurement_info().await.unwrap();
    // Deliberately reversed relative to native order.
    let picks = ChannelSelection::from_indices(&info, vec![2, 0]).unwrap();

    publisher.append(&frames(3, 0, 16));
    let epoch = session.get_epoch(8, &picks).await.unwrap();

    assert_eq!(epoch.channel_names, vec!["EOG 061".to_string(), "MEG 0112".into()]);
    // Row 0 carries channel 2's values, row 1 channel 0's.
    assert_eq!(epoch.data[0][0], (8 * 100 + 2) as f32);
    assert_eq!(epoch.data[1][0], (8 * 100) as f32);
}

#[tokio::test]
async fn attach_mid_stream_keeps_server_indexing() {
    let (addr, publisher) = spawn_loopback().await.unwrap();
    publisher.set_header(names(1), 100.0);
    // The server has been running for a while before we attach.
    publisher.append(&frames(1, 0, 500));

    let mut session = connect(addr.port(), RtClientConfig::default()).await;
    let info = session.get_measurement_info().await.unwrap();
    let picks = select_channels(&info, &all_eeg()).unwrap();

    publisher.append(&frames(1, 500, 64));
    let epoch = session.get_epoch(64, &picks).await.unwrap();
    assert_eq!(epoch.start_sample, 500);
    assert_eq!(epoch.data[0][0], 500.0 * 100.0);
}

#[tokio::test]
async fn consecutive_epochs_never_move_backwards() {
    let (addr, publisher) = spawn_loopback().await.unwrap();
    publisher.set_header(names(1), 1000.0);

    let mut session = connect(addr.port(), RtClientConfig::default()).await;
    let info = session.get_measurement_info().await.unwrap();
    let picks = select_channels(&info, &all_eeg()).unwrap();

    // Keep feeding while both epochs are retrieved.
    let feeder: Publisher = publisher.clone();
    let feed = tokio::spawn(async move {
        for block in 0..40 {
            feeder.append(&frames(1, block * 64, 64));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    });

    let first = session.get_epoch(512, &picks).await.unwrap();
    let second = session.get_epoch(512, &picks).await.unwrap();
    feed.abort();

    assert_eq!(first.n_samples(), 512);
    assert_eq!(second.n_samples(), 512);
    assert!(second.start_sample >= first.start_sample);
}

#[tokio::test]
async fn oversized_requests_fail_immediately() {
    let (addr, publisher) = spawn_loopback().await.unwrap();
    publisher.set_header(names(1), 100.0);

    let mut session = connect(
        addr.port(),
        RtClientConfig {
            buffer_secs: 0.5, // ring capacity: 50 samples
            ..Default::default()
        },
    )
    .await;
    let info = session.get_measurement_info().await.unwrap();
    let picks = select_channels(&info, &all_eeg()).unwrap();

    let err = session.get_epoch(1000, &picks).await.unwrap_err();
    assert!(matches!(err, Error::InvalidParameter(_)));
    let err = session.get_epoch(0, &picks).await.unwrap_err();
    assert!(matches!(err, Error::InvalidParameter(_)));
}

// ── Shutdown behaviour ───────────────────────────────────────────────────────

#[tokio::test]
async fn closing_unblocks_a_pending_retrieval() {
    let (addr, publisher) = spawn_loopback().await.unwrap();
    publisher.set_header(names(2), 1000.0);

    let mut session = connect(addr.port(), RtClientConfig::default()).await;
    let info = session.get_measurement_info().await.unwrap();
    let picks = select_channels(&info, &all_eeg()).unwrap();
    let handle = session.close_handle();

    // No samples at all: the retrieval is stuck in accumulation.
    let pending = session.get_epoch(2048, &picks);
    tokio::pin!(pending);
    assert!(timeout(Duration::from_millis(200), &mut pending).await.is_err());

    handle.close();
    let err = timeout(Duration::from_secs(1), &mut pending)
        .await
        .expect("close did not unblock the pending retrieval in time")
        .unwrap_err();
    assert!(matches!(err, Error::SessionClosed));
}

#[tokio::test]
async fn close_is_idempotent_and_poisons_later_calls() {
    let (addr, publisher) = spawn_loopback().await.unwrap();
    publisher.set_header(names(1), 100.0);

    let mut session = connect(addr.port(), RtClientConfig::default()).await;
    let info = session.get_measurement_info().await.unwrap();
    let picks = select_channels(&info, &all_eeg()).unwrap();

    session.close();
    session.close();
    assert_eq!(session.state(), SessionState::Closed);

    publisher.append(&frames(1, 0, 100));
    let err = session.get_epoch(10, &picks).await.unwrap_err();
    assert!(matches!(err, Error::SessionClosed));
}

#[tokio::test]
async fn server_death_fails_a_pending_retrieval_closed() {
    // A minimal hand-rolled server: answers the header request, then drops
    // the connection at the first sample wait.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        loop {
            let mut envelope = [0u8; 8];
            if stream.read_exact(&mut envelope).await.is_err() {
                return;
            }
            let def = decode_message_def(&envelope).unwrap();
            let mut payload = vec![0u8; def.bufsize as usize];
            stream.read_exact(&mut payload).await.unwrap();
            match def.command {
                GET_HDR => {
                    let resp = protocol::header_response(1, 0, 100.0, &names(1));
                    stream.write_all(&resp).await.unwrap();
                }
                WAIT_DAT => return, // connection dropped mid-session
                _ => return,
            }
        }
    });

    let mut session = connect(port, RtClientConfig::default()).await;
    let info = session.get_measurement_info().await.unwrap();
    let picks = select_channels(&info, &all_eeg()).unwrap();

    let err = timeout(Duration::from_secs(2), session.get_epoch(64, &picks))
        .await
        .expect("transport loss did not fail the retrieval in time")
        .unwrap_err();
    assert!(matches!(err, Error::SessionClosed));
    assert_eq!(session.state(), SessionState::Closed);
}

// ── Unreachable server ───────────────────────────────────────────────────────

#[tokio::test]
async fn refused_connection_is_a_connection_error() {
    // Grab a free port, then close the listener so connecting is refused.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let result = RtClient::new(RtClientConfig {
        host: "127.0.0.1".into(),
        port,
        connect_timeout_secs: 2,
        ..Default::default()
    })
    .connect()
    .await;

    assert!(matches!(result, Err(Error::Connection { .. })));
}
