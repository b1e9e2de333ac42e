//! End-to-end relay scenarios: publisher/reader rendezvous, slow-reader
//! overflow, on-demand sources, publisher override, live reload and the
//! digest challenge flow.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use switchboard::auth::{
    self, AuthProtocol, Credentials, DigestParams, RtspAuthorization,
};
use switchboard::conf::{Conf, PathConf};
use switchboard::error::{AuthFailure, RelayError};
use switchboard::media::{Codec, Format, Media, MediaKind, RtpPacket, TrackId};
use switchboard::path::{PathAuthor, PathManagerHandle};
use switchboard::session::rtmp::RtmpServer;
use switchboard::session::rtsp::{pause_after_auth_failure, RtspServer};
use switchboard::session::{PacketSink, SessionId, SessionKind};
use switchboard::stream::Stream;

fn remote() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 60000)
}

fn h264_media() -> Vec<Media> {
    vec![Media::new(
        MediaKind::Video,
        vec![Format::new(Codec::H264, 96, 90000)],
    )]
}

fn track() -> TrackId {
    TrackId::new(0, 0)
}

fn packet(seq: u16, ssrc: u32) -> RtpPacket {
    RtpPacket {
        payload_type: 96,
        sequence_number: seq,
        timestamp: u32::from(seq) * 3000,
        ssrc,
        marker: true,
        payload: Bytes::from_static(&[0x65, 0x88]),
    }
}

fn manager_with(paths: Vec<(&str, PathConf)>) -> PathManagerHandle {
    let mut conf = Conf::default();
    for (name, path_conf) in paths {
        conf.paths.insert(name.into(), path_conf);
    }
    PathManagerHandle::spawn(conf, CancellationToken::new())
}

fn anonymous() -> Credentials {
    Credentials::anonymous(remote().ip(), AuthProtocol::Rtsp)
}

fn noop_author(kind: SessionKind) -> PathAuthor {
    PathAuthor::new(SessionId::new(), kind, Arc::new(|| {}))
}

/// Sink that records the sequence numbers it was handed.
struct RecordingSink {
    seqs: Mutex<Vec<u16>>,
    ssrcs: Mutex<Vec<u32>>,
}

impl RecordingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            seqs: Mutex::new(Vec::new()),
            ssrcs: Mutex::new(Vec::new()),
        })
    }

    fn count(&self) -> usize {
        self.seqs.lock().unwrap().len()
    }
}

impl PacketSink for RecordingSink {
    fn write_rtp(&self, _track: TrackId, packet: &RtpPacket) -> bool {
        self.seqs.lock().unwrap().push(packet.sequence_number);
        self.ssrcs.lock().unwrap().push(packet.ssrc);
        true
    }
}

async fn wait_for(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

// One publisher, one reader, 100 packets delivered in order.
#[tokio::test]
async fn test_single_publisher_single_reader() {
    let pm = manager_with(vec![("cam1", PathConf::default())]);
    let rtsp = RtspServer::new(false, pm, CancellationToken::new());

    let pub_conn = rtsp.conn_new(remote());
    let publisher = rtsp.session_new(remote());
    publisher
        .on_announce(&pub_conn, "cam1", "", h264_media(), None)
        .await
        .unwrap();
    publisher.on_record().await.unwrap();

    let read_conn = rtsp.conn_new(remote());
    let reader = rtsp.session_new(remote());
    reader
        .on_setup_play(&read_conn, "cam1", "", track(), None)
        .await
        .unwrap();
    let sink = RecordingSink::new();
    reader.on_play(Arc::clone(&sink) as _).unwrap();

    for seq in 0..100 {
        publisher.write_packet(track(), packet(seq, 1));
    }

    wait_for(|| sink.count() == 100).await;
    let seqs = sink.seqs.lock().unwrap().clone();
    assert_eq!(seqs, (0..100).collect::<Vec<_>>());
}

// Ring depth 8, reader blocked while 20 units arrive: it resumes with
// the last 8 and an overflow counter of 12.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slow_reader_overflow() {
    let stream = Stream::new(h264_media(), 8, false);
    let reader = SessionId::new();

    let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();
    let gate_rx = Mutex::new(gate_rx);
    let received: Arc<Mutex<Vec<u16>>> = Arc::new(Mutex::new(Vec::new()));
    let received_cb = Arc::clone(&received);

    stream.reader_add(
        reader,
        track(),
        Arc::new(move |unit| {
            let seq = unit.rtp_packets[0].sequence_number;
            if seq == 0 {
                // hold the delivery task until the publisher is done
                let _ = gate_rx.lock().unwrap().recv();
            }
            received_cb.lock().unwrap().push(seq);
        }),
    );

    // the gate unit is pulled immediately and blocks the delivery task
    stream.write_unit(track(), switchboard::media::Unit::from_rtp(
        Codec::H264,
        Duration::ZERO,
        packet(0, 1),
    ));
    // give the delivery task time to pull the gate unit and block
    tokio::time::sleep(Duration::from_millis(100)).await;

    // 20 units while the reader is blocked; depth 8 keeps the last 8
    for seq in 1..=20 {
        stream.write_unit(track(), switchboard::media::Unit::from_rtp(
            Codec::H264,
            Duration::from_millis(u64::from(seq)),
            packet(seq, 1),
        ));
    }
    assert_eq!(stream.reader_overflow(reader), 12);

    gate_tx.send(()).unwrap();
    wait_for(|| received.lock().unwrap().len() == 9).await;
    let received = received.lock().unwrap().clone();
    assert_eq!(received, vec![0, 13, 14, 15, 16, 17, 18, 19, 20]);
}

// On-demand source launched by the first reader, relaunched after the
// linger window took it down.
#[tokio::test]
async fn test_on_demand_path() {
    let marker = std::env::temp_dir().join(format!("sb-ondemand-{}", std::process::id()));
    let _ = std::fs::remove_file(&marker);

    let mut path_conf = PathConf::default();
    path_conf.run_on_demand = format!("echo start >> {} && sleep 60", marker.display());
    path_conf.run_on_demand_close_after = 0.2;
    path_conf.run_on_demand_start_timeout = 5.0;
    let pm = manager_with(vec![("ondemand1", path_conf)]);

    let launches = |marker: &std::path::Path| {
        std::fs::read_to_string(marker)
            .map(|s| s.lines().count())
            .unwrap_or(0)
    };

    // first reader arrives, source is launched, reader waits
    let reader_task = {
        let pm = pm.clone();
        tokio::spawn(async move {
            pm.reader_add("ondemand1", noop_author(SessionKind::HlsMuxer), anonymous())
                .await
        })
    };
    wait_for(|| launches(&marker) == 1).await;

    // the launched source connects and publishes
    let publisher = noop_author(SessionKind::RtspSession);
    let publisher_id = publisher.id;
    let path = pm
        .publisher_add("ondemand1", publisher, anonymous())
        .await
        .unwrap();
    path.publisher_start(publisher_id, h264_media(), false)
        .await
        .unwrap();

    let (path, _stream) = reader_task.await.unwrap().unwrap();
    let reader_id = path.snapshot().readers[0].1;

    // last reader leaves; after the linger window the source is stopped
    path.reader_remove(reader_id);
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(launches(&marker), 1);

    // the killed source's publisher goes away with it
    path.publisher_remove(publisher_id);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // a new reader triggers a fresh launch
    let reader_task = {
        let pm = pm.clone();
        tokio::spawn(async move {
            pm.reader_add("ondemand1", noop_author(SessionKind::HlsMuxer), anonymous())
                .await
        })
    };
    wait_for(|| launches(&marker) == 2).await;
    reader_task.abort();

    let _ = std::fs::remove_file(&marker);
}

// overridePublisher displaces A; readers see EOF, re-subscribe and then
// receive only B's data.
#[tokio::test]
async fn test_publisher_override() {
    let mut path_conf = PathConf::default();
    path_conf.override_publisher = true;
    let pm = manager_with(vec![("cam1", path_conf)]);

    let rtsp = RtspServer::new(false, pm.clone(), CancellationToken::new());
    let rtmp = RtmpServer::new(false, pm.clone(), CancellationToken::new());

    // publisher A over RTSP
    let a_conn = rtsp.conn_new(remote());
    let a = rtsp.session_new(remote());
    a.on_announce(&a_conn, "cam1", "", h264_media(), None)
        .await
        .unwrap();
    a.on_record().await.unwrap();

    // a reader
    let r_conn = rtsp.conn_new(remote());
    let reader = rtsp.session_new(remote());
    reader
        .on_setup_play(&r_conn, "cam1", "", track(), None)
        .await
        .unwrap();
    let sink = RecordingSink::new();
    reader.on_play(Arc::clone(&sink) as _).unwrap();

    a.write_packet(track(), packet(1, 1));
    wait_for(|| sink.count() == 1).await;

    // publisher B displaces A over RTMP
    let b = rtmp.conn_new(remote());
    b.on_publish("cam1", "", h264_media()).await.unwrap();

    // A was kicked, and so was the old stream's reader
    wait_for(|| a.cancel.is_cancelled()).await;
    wait_for(|| reader.cancel.is_cancelled()).await;

    // A's writes go nowhere now
    a.write_packet(track(), packet(2, 1));

    // the reader re-subscribes and receives only B's data
    let r2_conn = rtsp.conn_new(remote());
    let reader2 = rtsp.session_new(remote());
    reader2
        .on_setup_play(&r2_conn, "cam1", "", track(), None)
        .await
        .unwrap();
    let sink2 = RecordingSink::new();
    reader2.on_play(Arc::clone(&sink2) as _).unwrap();

    b.write_packet(track(), packet(10, 2));
    wait_for(|| sink2.count() == 1).await;
    assert_eq!(*sink2.ssrcs.lock().unwrap(), vec![2]);
}

// Editing a path's read ACL replaces the path and terminates its
// readers; the old identity stops working, the new one works.
#[tokio::test]
async fn test_configuration_live_reload() {
    let mut protected = PathConf::default();
    protected.read_user = "alice".into();
    protected.read_pass = "pw".into();
    let mut conf = Conf::default();
    conf.paths.insert("a".into(), protected);
    let pm = PathManagerHandle::spawn(conf.clone(), CancellationToken::new());
    let rtsp = RtspServer::new(false, pm.clone(), CancellationToken::new());

    // publisher + alice reading
    let p_conn = rtsp.conn_new(remote());
    let publisher = rtsp.session_new(remote());
    publisher
        .on_announce(&p_conn, "a", "", h264_media(), None)
        .await
        .unwrap();
    publisher.on_record().await.unwrap();

    let r_conn = rtsp.conn_new(remote());
    let alice = rtsp.session_new(remote());
    alice
        .on_setup_play(&r_conn, "a", "user=alice&pass=pw", track(), None)
        .await
        .unwrap();

    // admin edits the ACL to bob
    let mut edited = PathConf::default();
    edited.read_user = "bob".into();
    edited.read_pass = "pw2".into();
    let mut new_conf = conf.clone();
    new_conf.paths.insert("a".into(), edited);
    pm.reload(new_conf);

    // the path was replaced; alice's session got terminated
    wait_for(|| alice.cancel.is_cancelled()).await;

    // re-publish on the fresh path
    let p2_conn = rtsp.conn_new(remote());
    let publisher2 = rtsp.session_new(remote());
    publisher2
        .on_announce(&p2_conn, "a", "", h264_media(), None)
        .await
        .unwrap();
    publisher2.on_record().await.unwrap();

    // alice fails, bob succeeds
    let r2_conn = rtsp.conn_new(remote());
    let alice2 = rtsp.session_new(remote());
    let result = alice2
        .on_setup_play(&r2_conn, "a", "user=alice&pass=pw", track(), None)
        .await;
    assert!(matches!(result, Err(RelayError::Auth(_))));

    let r3_conn = rtsp.conn_new(remote());
    let bob = rtsp.session_new(remote());
    bob.on_setup_play(&r3_conn, "a", "user=bob&pass=pw2", track(), None)
        .await
        .unwrap();
}

// Missing credentials yield a challenge carrying the conn nonce; a
// correct digest passes; a wrong one fails again after the uniform
// delay.
#[tokio::test(start_paused = true)]
async fn test_authentication_challenge() {
    let mut protected = PathConf::default();
    protected.read_user = "alice".into();
    protected.read_pass = "pw".into();
    let pm = manager_with(vec![("a", protected)]);
    let rtsp = RtspServer::new(false, pm.clone(), CancellationToken::new());

    // active publisher so reads can succeed
    let publisher = noop_author(SessionKind::RtspSession);
    let publisher_id = publisher.id;
    let path = pm.publisher_add("a", publisher, anonymous()).await.unwrap();
    path.publisher_start(publisher_id, h264_media(), false)
        .await
        .unwrap();

    let conn = rtsp.conn_new(remote());

    // no credentials: challenge needed
    let reader = rtsp.session_new(remote());
    let err = reader
        .on_setup_play(&conn, "a", "", track(), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RelayError::Auth(AuthFailure::CredentialsMissing)
    ));
    // the wire layer answers 401 with a WWW-Authenticate carrying this
    let nonce = conn.nonce();
    assert!(!nonce.is_empty());

    // correct digest
    let uri = "rtsp://localhost:8554/a/";
    let response = auth::digest_response("alice", "pw", &nonce, "SETUP", uri);
    let reader = rtsp.session_new(remote());
    reader
        .on_setup_play(
            &conn,
            "a",
            "",
            track(),
            Some(RtspAuthorization::Digest(DigestParams {
                username: "alice".into(),
                realm: auth::REALM.into(),
                nonce: nonce.clone(),
                uri: uri.into(),
                response,
            })),
        )
        .await
        .unwrap();

    // wrong digest: 401 again, after a uniform delay of at least 500 ms
    let reader = rtsp.session_new(remote());
    let before = tokio::time::Instant::now();
    let err = reader
        .on_setup_play(
            &conn,
            "a",
            "",
            track(),
            Some(RtspAuthorization::Digest(DigestParams {
                username: "alice".into(),
                realm: auth::REALM.into(),
                nonce: nonce.clone(),
                uri: uri.into(),
                response: "f".repeat(32),
            })),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Auth(AuthFailure::CredentialsWrong)));
    pause_after_auth_failure(&err).await;
    assert!(before.elapsed() >= Duration::from_millis(500));
}

// After readerRemove, the callback fires zero more times.
#[tokio::test]
async fn test_no_callback_after_reader_remove() {
    let stream = Stream::new(h264_media(), 16, false);
    let reader = SessionId::new();
    let hits = Arc::new(AtomicU64::new(0));
    let hits_cb = Arc::clone(&hits);

    stream.reader_add(
        reader,
        track(),
        Arc::new(move |_| {
            hits_cb.fetch_add(1, Ordering::SeqCst);
        }),
    );
    stream.write_unit(
        track(),
        switchboard::media::Unit::from_rtp(Codec::H264, Duration::ZERO, packet(0, 1)),
    );
    wait_for(|| hits.load(Ordering::SeqCst) == 1).await;

    stream.reader_remove(reader);
    for seq in 1..10 {
        stream.write_unit(
            track(),
            switchboard::media::Unit::from_rtp(Codec::H264, Duration::ZERO, packet(seq, 1)),
        );
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

// Readers that arrive before publisherStart all join at once.
#[tokio::test]
async fn test_pending_readers_join_simultaneously() {
    let mut path_conf = PathConf::default();
    path_conf.run_on_demand = "sleep 60".into();
    let pm = manager_with(vec![("ondemand2", path_conf)]);

    let mut reader_tasks = Vec::new();
    for _ in 0..5 {
        let pm = pm.clone();
        reader_tasks.push(tokio::spawn(async move {
            pm.reader_add("ondemand2", noop_author(SessionKind::HlsMuxer), anonymous())
                .await
        }));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let publisher = noop_author(SessionKind::RtspSession);
    let publisher_id = publisher.id;
    let path = pm
        .publisher_add("ondemand2", publisher, anonymous())
        .await
        .unwrap();
    let stream = path
        .publisher_start(publisher_id, h264_media(), false)
        .await
        .unwrap();

    for task in reader_tasks {
        let (_, reader_stream) = task.await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&stream, &reader_stream));
    }
    assert_eq!(path.snapshot().readers.len(), 5);
}
