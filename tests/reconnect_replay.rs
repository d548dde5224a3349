//! S6 (reconnect with template replay) from spec.md section 8: a
//! destination that drops mid-stream is demoted, reconnected by the
//! background worker, and must receive a replayed template definition -
//! dated well in the past - before any further data.

use std::io::Read;
use std::net::TcpListener;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ipfix_forward::config::{DestinationConfig, Distribution, ForwardingConfig};
use ipfix_forward::dispatcher::IncomingItem;
use ipfix_forward::templates::TemplateType;
use ipfix_forward::ForwardingDispatcher;

#[test]
fn reconnect_replays_templates_before_new_data() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let config = ForwardingConfig {
        distribution: Distribution::All,
        packet_size: 4096,
        reconnection_period: Duration::from_millis(20),
        destinations: vec![DestinationConfig {
            host: addr.ip().to_string(),
            port: Some(addr.port().to_string()),
        }],
        ..ForwardingConfig::default()
    };

    // First connection: reads the initial template+data message, then the
    // peer side is dropped to simulate a mid-stream disconnect.
    let first_len = 16 + (4 + 8) + (4 + 12); // header + template set + data set
    let first_accept = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = vec![0u8; first_len];
        stream.read_exact(&mut buf).unwrap();
        (listener, buf)
    });

    let mut dispatcher = ForwardingDispatcher::new(&config);
    thread::sleep(Duration::from_millis(80)); // initial connect + promote

    let template_rec = [1u8, 0, 0, 1, 0, 4, 0, 4]; // private_id=256, count=1, one field
    let mut data_set = vec![1u8, 0, 0, 16];
    data_set[0..2].copy_from_slice(&256u16.to_be_bytes());
    data_set.extend_from_slice(&[0u8; 12]);

    let first_items = vec![
        IncomingItem::TemplateRecord { bytes: &template_rec, ttype: TemplateType::Normal },
        IncomingItem::DataSet { flowset_id: 256, bytes: &data_set, record_count: 3 },
    ];
    dispatcher.dispatch(1, 7, 1_000, &first_items);

    let (listener, first_received) = first_accept.join().unwrap();
    assert_eq!(first_received.len(), first_len);
    // The accepted stream went out of scope inside the thread closure,
    // closing the peer's end of the connection; the listener itself stays
    // alive below to accept the reconnector's retry.

    // Second connection: the reconnector re-establishes it after demotion;
    // the first bytes it reads must be a replayed template definition.
    let replay_len = 16 + (4 + 8); // header + template set (no data)
    let second_accept = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = vec![0u8; replay_len];
        stream.read_exact(&mut buf).unwrap();
        buf
    });

    // Data set referencing the already-known template, no new templates:
    // this is the message whose send discovers the peer is gone. Retried
    // a few times since detecting a closed peer can take one failed
    // attempt after the FIN/RST actually arrives.
    let followup_items = vec![IncomingItem::DataSet { flowset_id: 256, bytes: &data_set, record_count: 1 }];
    for _ in 0..20 {
        dispatcher.dispatch(1, 7, 1_001, &followup_items);
        thread::sleep(Duration::from_millis(30));
        if second_accept.is_finished() {
            break;
        }
    }

    let replay = second_accept.join().unwrap();
    assert_eq!(replay.len(), replay_len);

    let version = u16::from_be_bytes([replay[0], replay[1]]);
    assert_eq!(version, 10);

    let export_time = u32::from_be_bytes([replay[4], replay[5], replay[6], replay[7]]) as u64;
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
    assert!(export_time <= now.saturating_sub(600), "replay export_time must be backdated by >= 600s");
    assert!(now - export_time < 650, "replay export_time should be roughly 600s in the past, not arbitrarily old");

    let flowset_id = u16::from_be_bytes([replay[16], replay[17]]);
    assert_eq!(flowset_id, 2, "replayed Set must be a Template Set");
    let tmpl_id = u16::from_be_bytes([replay[20], replay[21]]);
    assert_eq!(tmpl_id, 256, "replayed template must carry the shared ID");
}
