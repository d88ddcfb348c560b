use bytes::{Bytes, BytesMut};
use tickrelay_protocol::{
	ClientMessage, DecodeEvent, FRAME_ID_MAX, FrameEntry, Handshake, MessageDecoder, SlotData, TickPacket,
};

fn decode_all(bytes: &[u8]) -> Vec<ClientMessage> {
	let mut decoder = MessageDecoder::new();
	decoder.feed(bytes);

	let mut out = Vec::new();
	while let Some(event) = decoder.poll().expect("decode") {
		if let DecodeEvent::Message(msg) = event {
			out.push(msg);
		}
	}
	out
}

#[test]
fn client_encoding_is_read_back_by_server_decoder() {
	let msg = ClientMessage::new(12, Bytes::from_static(b"input"))
		.with_command(b"chat:hello")
		.with_command(b"");

	let wire = msg.encode().expect("encode");
	assert_eq!(wire[0], 5);
	assert_eq!(&wire[1..5], &12u32.to_be_bytes());

	let decoded = decode_all(&wire);
	assert_eq!(decoded, vec![msg]);
}

#[test]
fn decoder_handles_single_byte_delivery() {
	let first = ClientMessage::new(1, Bytes::from_static(b"a")).with_command(b"x");
	let second = ClientMessage::new(FRAME_ID_MAX - 1, Bytes::new());

	let mut wire = first.encode().expect("encode").to_vec();
	wire.extend_from_slice(&second.encode().expect("encode"));

	let mut decoder = MessageDecoder::new();
	let mut got = Vec::new();
	for b in wire {
		decoder.feed(&[b]);
		while let Some(event) = decoder.poll().expect("decode") {
			if let DecodeEvent::Message(msg) = event {
				got.push(msg);
			}
		}
	}

	assert_eq!(got, vec![first, second]);
}

#[test]
fn handshake_followed_by_tick_in_one_buffer() {
	let hs = Handshake {
		slot_index: 0,
		client_count: 2,
		frame_id: 5,
	};
	let packet = TickPacket {
		frame_id: 5,
		slots: vec![
			SlotData::Present(vec![FrameEntry {
				target_frame: 6,
				payload: Bytes::from_static(b"p"),
				commands: Vec::new(),
			}]),
			SlotData::Absent,
		],
	};

	let mut buf = BytesMut::new();
	buf.extend_from_slice(&hs.encode());
	buf.extend_from_slice(&packet.encode());

	assert_eq!(Handshake::try_decode(&mut buf).expect("handshake"), Some(hs));
	assert_eq!(TickPacket::try_decode(&mut buf).expect("tick"), Some(packet));
	assert!(buf.is_empty());
}

#[test]
fn tick_packet_rejects_out_of_range_frame() {
	let mut buf = BytesMut::new();
	buf.extend_from_slice(&FRAME_ID_MAX.to_be_bytes());
	buf.extend_from_slice(&[0]);

	assert!(TickPacket::try_decode(&mut buf).is_err());
}
