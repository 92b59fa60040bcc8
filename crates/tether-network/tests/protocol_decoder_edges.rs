use bytes::{BufMut, Bytes, BytesMut};
use tether_network::protocol::{ControlMessage, Frame, FramedCodec, PROTOCOL_VERSION};
use tether_network::NetworkError;

#[test]
fn partial_buffer_then_complete_decodes_once_ready() {
    let frame = Frame::Control(ControlMessage::Hello {
        version: PROTOCOL_VERSION,
        client_id: 123,
    });
    let mut full = BytesMut::new();
    FramedCodec::encode(&frame, &mut full).expect("encode");

    // Not even the length prefix yet
    let mid = 2;
    let mut buf = BytesMut::from(&full[..mid]);
    let res = FramedCodec::decode(&mut buf).expect("decode ok");
    assert!(res.is_none(), "not enough bytes for length prefix");

    // One byte short of the full frame
    let mid2 = full.len() - mid - 1;
    buf.extend_from_slice(&full[mid..mid + mid2]);
    let res2 = FramedCodec::decode(&mut buf).expect("decode ok");
    assert!(res2.is_none(), "still incomplete frame");

    buf.extend_from_slice(&full[mid + mid2..]);
    let decoded = FramedCodec::decode(&mut buf)
        .expect("decode ok")
        .expect("now complete");

    assert_eq!(decoded, frame);
    assert!(buf.is_empty());
}

#[test]
fn invalid_control_payload_returns_error() {
    let mut buf = BytesMut::new();
    buf.put_u32(4);
    buf.put_u8(tether_network::TAG_SYNC_CONTROL);
    buf.extend_from_slice(&[0xde, 0xad, 0xbe]);

    let err = FramedCodec::decode(&mut buf).unwrap_err();
    let msg = format!("{err}");
    assert!(msg.contains("Protocol error"), "{msg}");
}

#[test]
fn zero_length_frame_is_rejected() {
    let mut buf = BytesMut::new();
    buf.put_u32(0);
    assert!(matches!(
        FramedCodec::decode(&mut buf),
        Err(NetworkError::ProtocolError(_))
    ));
}

#[test]
fn foreign_frames_pass_through_untouched() {
    let mut buf = BytesMut::new();
    for tag in [0x00, 0x3F, 0x50, 0xFF] {
        let frame = Frame::Foreign {
            tag,
            payload: Bytes::from(vec![tag; 3]),
        };
        FramedCodec::encode(&frame, &mut buf).expect("encode");
    }

    for tag in [0x00, 0x3F, 0x50, 0xFF] {
        match FramedCodec::decode(&mut buf).expect("decode").expect("frame") {
            Frame::Foreign { tag: got, payload } => {
                assert_eq!(got, tag);
                assert_eq!(payload.as_ref(), &[tag; 3]);
            }
            other => panic!("expected foreign frame, got {other:?}"),
        }
    }
}
