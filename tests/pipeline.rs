//! End-to-end pipeline tests: raw record lines through accumulation,
//! enrichment, the durable queue and an output worker, down to a peer
//! socket.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixListener;
use tokio::sync::watch;
use tokio_util::codec::{Encoder, FramedRead};

use auditmux::codecs::{AckCodec, FrameCodec};
use auditmux::event::record_type::RecordType;
use auditmux::event::{Event, EventId, EVENT_FLAG_SYNTHESIZED};
use auditmux::sinks::unix::{OutputWorker, UnixSinkConfig};
use auditmux::sources::audit::accumulator::Accumulator;
use auditmux::sources::audit::record::RawRecord;
use auditmux::transforms::aggregate::rule::AggregationRule;
use auditmux::transforms::aggregate::{Aggregator, HandleOutcome};
use auditmux::transforms::enrich::interpret::UserDb;
use auditmux::transforms::enrich::{EnrichConfig, Enricher};
use auditmux_buffers::{Queue, QueueConfig};

struct RootOnlyDb;

impl UserDb for RootOnlyDb {
    fn user_name(&self, uid: u32) -> Option<String> {
        (uid == 0).then(|| "root".to_string())
    }

    fn group_name(&self, gid: u32) -> Option<String> {
        (gid == 0).then(|| "root".to_string())
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}

fn assemble(lines: &[String]) -> Vec<Event> {
    let mut accumulator = Accumulator::new();
    let mut out = Vec::new();
    for line in lines {
        let record = RawRecord::parse(RecordType::UNKNOWN, line.as_bytes()).unwrap();
        accumulator.add_record(record, &mut out);
    }
    accumulator.flush(Duration::ZERO, &mut out);
    out
}

fn execve_lines(id: &str) -> Vec<String> {
    let arg5 = hex(b"zfs incremental backup of rpool/lxd failed: ");
    vec![
        format!("type=SYSCALL msg=audit({id}): arch=c000003e syscall=59 success=yes exit=0 a0=55d782899468 a1=55d78289b2a8 a2=55d78289ae08 a3=8 items=2 ppid=26595 pid=26918 auid=0 uid=0 gid=0 euid=0 suid=0 fsuid=0 egid=0 sgid=0 fsgid=0 tty=(none) ses=842 comm=\"logger\" exe=\"/usr/bin/logger\" key=(null)"),
        format!("type=EXECVE msg=audit({id}): argc=6 a0=\"logger\" a1=\"-t\" a2=\"zfs-backup\" a3=\"-p\" a4=\"daemon.err\" a5={arg5}"),
        format!("type=CWD msg=audit({id}): cwd=\"/\""),
        format!("type=PATH msg=audit({id}): item=0 name=\"/usr/bin/logger\" inode=312545 dev=fe:00 mode=0100755 ouid=0 ogid=0 rdev=00:00 nametype=NORMAL"),
        format!("type=PATH msg=audit({id}): item=1 name=\"/lib64/ld-linux-x86-64.so.2\" inode=5767 dev=fe:00 mode=0100755 ouid=0 ogid=0 rdev=00:00 nametype=NORMAL"),
        format!("type=EOE msg=audit({id}): "),
    ]
}

fn enrich(events: &[Event]) -> Vec<Event> {
    let mut enricher = Enricher::new(EnrichConfig::default(), Arc::new(RootOnlyDb));
    let mut out = Vec::new();
    for event in events {
        enricher.process(event, &mut out);
    }
    out
}

#[test]
fn execve_event_end_to_end_shape() {
    let events = assemble(&execve_lines("1521757638.392:262332"));
    assert_eq!(events.len(), 1);

    let enriched = enrich(&events);
    assert_eq!(enriched.len(), 1);
    let event = &enriched[0];
    event.validate().unwrap();

    assert_eq!(event.id(), EventId::new(1521757638, 392, 262332));
    assert_eq!(event.flags(), EVENT_FLAG_SYNTHESIZED);

    let rec = event.record_at(0).unwrap();
    assert_eq!(rec.record_type(), RecordType::AUOMS_EXECVE);
    assert_eq!(
        rec.field_by_name("cmdline").unwrap().raw(),
        b"logger -t zfs-backup -p daemon.err \"zfs incremental backup of rpool/lxd failed: \""
            as &[u8]
    );
    assert_eq!(
        rec.field_by_name("path_name").unwrap().raw(),
        b"[\"/usr/bin/logger\",\"/lib64/ld-linux-x86-64.so.2\"]" as &[u8]
    );
    assert_eq!(rec.field_by_name("syscall").unwrap().interp(), Some(&b"execve"[..]));
    for uid_field in ["uid", "auid", "euid", "suid", "fsuid"] {
        assert_eq!(
            rec.field_by_name(uid_field).unwrap().interp(),
            Some(&b"root"[..]),
            "{uid_field} should resolve to root"
        );
    }
}

#[test]
fn aggregation_over_enriched_events() {
    // Aggregate consolidated execve events by pid over everything else.
    let rule_json = r#"{
        "match_rule": {
            "record_types": ["AUOMS_EXECVE"],
            "field_rules": [{ "name": "syscall", "op": "eq", "value": "execve" }]
        },
        "aggregation_fields": {
            "pid": { "mode": "raw" }
        },
        "max_count": 2
    }"#;

    let mut aggregator = Aggregator::new();
    aggregator
        .set_rules(vec![AggregationRule::from_json_str(rule_json).unwrap()])
        .unwrap();

    // Three identical execve events except for their serials.
    for serial in 0..3u64 {
        let events = assemble(&execve_lines(&format!("1521757638.392:26233{serial}")));
        let enriched = enrich(&events);
        assert!(aggregator.add_event(&enriched[0]), "event {serial} should aggregate");
    }

    // Two filled the first aggregate; the third reopened.
    assert_eq!(aggregator.num_ready(), 1);
    assert_eq!(aggregator.num_pending(), 1);

    let mut emitted = Vec::new();
    while let HandleOutcome::Handled { consumed: true, .. } = aggregator.handle_ready(|event| {
        emitted.push(event.clone());
        (0, true)
    }) {}

    assert_eq!(emitted.len(), 1);
    let rec = emitted[0].record_at(0).unwrap();
    assert_eq!(rec.record_type(), RecordType::AUOMS_AGGREGATE);
    assert_eq!(rec.field_by_name("num_aggregated_events").unwrap().raw(), b"2");
    assert_eq!(rec.field_by_name("original_record_type").unwrap().raw(), b"AUOMS_EXECVE");
    assert_eq!(rec.field_by_name("pid").unwrap().raw(), b"[\"26918\",\"26918\"]");
    // The cmdline was not aggregated, so it passes through once.
    assert!(rec.field_by_name("cmdline").is_some());
}

#[tokio::test]
async fn queue_to_peer_delivery() {
    let dir = tempfile::tempdir().unwrap();
    let sock = dir.path().join("peer.sock");
    let listener = UnixListener::bind(&sock).unwrap();

    let received: Arc<Mutex<Vec<EventId>>> = Arc::new(Mutex::new(Vec::new()));
    let peer_received = Arc::clone(&received);
    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else { return };
        let (read_half, mut write_half) = stream.into_split();
        let mut frames = FramedRead::new(read_half, FrameCodec::default());
        while let Some(Ok(payload)) = frames.next().await {
            let event = Event::from_bytes(payload);
            assert!(event.validate().is_ok());
            peer_received.lock().unwrap().push(event.id());
            let mut buf = bytes::BytesMut::new();
            AckCodec.encode(event.id(), &mut buf).unwrap();
            if write_half.write_all(&buf).await.is_err() {
                return;
            }
        }
    });

    let queue = Queue::open(QueueConfig::new(dir.path().join("queue"))).await.unwrap();
    let cursor = queue.register("peer").await;

    // Enriched events go through the queue exactly as bytes.
    let events = enrich(&assemble(&execve_lines("1521757638.392:262332")));
    queue.put(3, events[0].as_bytes(), None).await.unwrap();
    let passthrough = enrich(&assemble(&[
        "type=LOGIN msg=audit(55.000:3): pid=977 uid=0 auid=1000 ses=4".to_string(),
    ]));
    queue.put(2, passthrough[0].as_bytes(), None).await.unwrap();

    let mut config = UnixSinkConfig::new("peer", sock.to_string_lossy());
    config.ack_timeout = Duration::from_secs(2);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = tokio::spawn(OutputWorker::new(config, cursor).run(shutdown_rx));

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if received.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    queue.close().await;
    tokio::time::timeout(Duration::from_secs(5), worker).await.unwrap().unwrap();

    // The LOGIN event sat in a higher-priority band, so it arrives first.
    let received = received.lock().unwrap();
    assert_eq!(received[0], EventId::new(55, 0, 3));
    assert_eq!(received[1], EventId::new(1521757638, 392, 262332));
}
