//! Client over a SocketCAN device backed by scripted sockets

use can_link::transport::SocketCall;
use can_link::{
    CanClient, CanError, DatabaseConfig, DatabaseSchema, DeviceConfig, ErrorKind, Frame,
    MockSocketOps, SocketCanDevice,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const SUBARU_DBC: &str = r#"
VERSION ""

BU_: ES EPS ECM

BO_ 290 ES_LKAS: 8 ES
 SG_ CHECKSUM : 0|8@1+ (1,0) [0|255] "" EPS
 SG_ COUNTER : 8|4@1+ (1,0) [0|15] "" EPS
 SG_ LKAS_Output : 16|13@1- (-1,0) [-8191|8191] "" EPS
 SG_ LKAS_Request : 29|1@1+ (1,0) [0|1] "" EPS

BO_ 281 Steering_Torque: 8 EPS
 SG_ Steer_Torque_Sensor : 16|11@1- (-1,0) [-1000|1000] "" ES
 SG_ Steering_Angle : 32|16@1- (-0.1,0) [-3276.8|3276.7] "deg" ES

BO_ 320 Engine: 8 ECM
 SG_ Engine_RPM : 7|16@0+ (0.25,0) [0|16383.75] "rpm" ES

VAL_ 290 LKAS_Request 1 "Active" 0 "Off" ;
"#;

fn setup() -> (Arc<MockSocketOps>, CanClient<SocketCanDevice>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let ops = Arc::new(MockSocketOps::new());
    let device = SocketCanDevice::open("vcan0", ops.clone()).unwrap();
    let database = DatabaseSchema::parse(SUBARU_DBC, &DatabaseConfig::default()).unwrap();
    (ops, CanClient::new(device, Arc::new(database)))
}

fn values(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
    pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

#[test]
fn test_receive_decode_pipeline() {
    let (ops, client) = setup();
    // Steer torque -5 (0x7FB in 11 bits), angle 12.3 deg (raw -123)
    let angle = (-123i16).to_le_bytes();
    ops.push_frame(&Frame::new(281, &[0, 0, 0xFB, 0x07, angle[0], angle[1], 0, 0]).unwrap());
    // Engine RPM 800 (raw 3200 = 0x0C80, big-endian)
    ops.push_frame(&Frame::new(320, &[0x0C, 0x80, 0, 0, 0, 0, 0, 0]).unwrap());
    ops.push_frame(&Frame::new(0x7E8, &[0x02, 0x50, 0x03]).unwrap());

    for _ in 0..4 {
        client.enqueue_messages();
    }

    let messages = client.get_queued_messages_and_clear_queue();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].name, "Steering_Torque");
    assert_eq!(messages[0].value("Steer_Torque_Sensor"), Some(5.0));
    let angle = messages[0].value("Steering_Angle").unwrap();
    assert!((angle - 12.3).abs() < 1e-9);
    assert_eq!(messages[1].name, "Engine");
    assert_eq!(messages[1].value("Engine_RPM"), Some(800.0));

    let raw = client.get_raw_data_and_clear_queue();
    assert_eq!(raw.len(), 3);
    assert_eq!(raw[2].address(), 0x7E8);
}

#[test]
fn test_read_error_enqueues_nothing() {
    let (ops, client) = setup();
    ops.push_read_error(ErrorKind::CommunicationError, libc::ENETDOWN);
    client.enqueue_messages();
    assert!(client.get_queued_messages_and_clear_queue().is_empty());
    assert!(client.get_raw_data_and_clear_queue().is_empty());
}

#[test]
fn test_send_writes_checksummed_frame() {
    let (ops, client) = setup();
    let message = client
        .create_message("ES_LKAS", &values(&[("LKAS_Output", 250.0), ("LKAS_Request", 1.0)]))
        .unwrap();

    let first = client.send_message(&message).unwrap();
    let second = client.send_message(&message).unwrap();

    let frames = ops.written_frames();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].address(), 290);
    assert_eq!(frames[0].data(), first.as_slice());
    assert_eq!(frames[1].data(), second.as_slice());
    assert_eq!(first[1] & 0x0F, 0);
    assert_eq!(second[1] & 0x0F, 1);
    assert_eq!(first[0], can_link::subaru_checksum(290, &first));
    assert_ne!(first[0], second[0]);
}

#[test]
fn test_sent_frame_decodes_back() {
    let (ops, client) = setup();
    let message = client
        .create_message("ES_LKAS", &values(&[("LKAS_Output", -300.0), ("LKAS_Request", 1.0)]))
        .unwrap();
    client.send_message(&message).unwrap();

    ops.push_frame(&ops.written_frames()[0]);
    client.enqueue_messages();
    let decoded = client.get_queued_messages_and_clear_queue().remove(0);
    assert_eq!(decoded.value("LKAS_Output"), Some(-300.0));
    assert_eq!(decoded.value("LKAS_Request"), Some(1.0));
    assert_eq!(decoded.value("COUNTER"), Some(0.0));
}

#[test]
fn test_send_unknown_name_writes_nothing() {
    let (ops, client) = setup();
    let err = client
        .send_message(&can_link::Message::new(290, "Not_In_Dbc"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SchemaNotFound);
    assert!(err.payload.is_none());
    assert_eq!(ops.call_count(SocketCall::Write), 0);
}

#[test]
fn test_write_failure_returns_payload() {
    let (ops, client) = setup();
    ops.fail_once(SocketCall::Write, ErrorKind::CommunicationError, libc::ENOBUFS);
    let message = client
        .create_message("ES_LKAS", &values(&[("LKAS_Output", 10.0)]))
        .unwrap();

    let err = client.send_message(&message).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CommunicationError);
    assert_eq!(err.source.errno(), Some(libc::ENOBUFS));
    let payload = err.payload.unwrap();
    assert_eq!(payload.len(), 8);
    assert_eq!(payload[2], 0xF6);
}

#[test]
fn test_listen_for_message_by_address() {
    let (ops, client) = setup();
    ops.push_frame(&Frame::new(0x100, &[1]).unwrap());
    ops.push_frame(&Frame::new(0x101, &[2]).unwrap());
    ops.push_frame(&Frame::new(290, &[3; 8]).unwrap());

    let frame = client
        .listen_for_message_by_address(290, Duration::from_secs(1))
        .unwrap();
    assert_eq!(frame.data(), &[3; 8]);
    assert_eq!(ops.pending_reads(), 0);
}

#[test]
fn test_listen_times_out() {
    let (ops, client) = setup();
    ops.push_frame(&Frame::new(0x100, &[1]).unwrap());
    let err = client
        .listen_for_message_by_address(290, Duration::from_millis(25))
        .unwrap_err();
    assert!(matches!(err, CanError::Timeout { address: 290, .. }));
    assert_eq!(err.kind(), ErrorKind::Timeout);
}

#[test]
fn test_send_raw_message_bypasses_schema() {
    let (ops, client) = setup();
    client.send_raw_message(0x7E0, &[0x02, 0x10, 0x03]).unwrap();
    let frames = ops.written_frames();
    assert_eq!(frames[0].address(), 0x7E0);
    assert_eq!(frames[0].data(), &[0x02, 0x10, 0x03]);
}

#[test]
fn test_shared_between_threads() {
    let (ops, client) = setup();
    let client = Arc::new(client);
    for i in 0..8u8 {
        ops.push_frame(&Frame::new(281, &[0, 0, i, 0, 0, 0, 0, 0]).unwrap());
    }

    let poller = {
        let client = Arc::clone(&client);
        std::thread::spawn(move || {
            for _ in 0..8 {
                client.enqueue_messages();
            }
        })
    };
    let message = client
        .create_message("ES_LKAS", &values(&[("LKAS_Request", 1.0)]))
        .unwrap();
    for _ in 0..4 {
        client.send_message(&message).unwrap();
    }
    poller.join().unwrap();

    assert_eq!(client.get_queued_messages_and_clear_queue().len(), 8);
    assert_eq!(ops.written_frames().len(), 4);
}

#[test]
fn test_duplicate_address_rejected() {
    let text = "BO_ 290 A: 8 X\n SG_ S : 0|8@1+ (1,0) [0|0] \"\" X\n\nBO_ 290 B: 8 X\n";
    let err = DatabaseSchema::parse(text, &DatabaseConfig::default()).unwrap_err();
    assert!(matches!(err, CanError::DbcParse(_)));
}

#[test]
fn test_fd_device_accepts_long_payload() {
    let ops = Arc::new(MockSocketOps::new());
    let device =
        SocketCanDevice::open_with_config(DeviceConfig::new("vcan0").with_fd_frames(true), ops.clone())
            .unwrap();
    let text = "BO_ 1024 Long: 16 X\n SG_ CHECKSUM : 0|8@1+ (1,0) [0|255] \"\" X\n SG_ Tail : 120|8@1+ (1,0) [0|255] \"\" X\n";
    let database = DatabaseSchema::parse(text, &DatabaseConfig::default()).unwrap();
    let client = CanClient::new(device, Arc::new(database));

    let message = client.create_message("Long", &values(&[("Tail", 7.0)])).unwrap();
    let payload = client.send_message(&message).unwrap();
    assert_eq!(payload.len(), 16);
    assert_eq!(payload[15], 7);
    assert_eq!(ops.written_frames()[0].dlc(), 10);
}
