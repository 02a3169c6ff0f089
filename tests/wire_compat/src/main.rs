fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;
    use std::path::PathBuf;

    use relaydrop_protocol::chunk::{ChunkHeader, compute_checksum, decode_chunk, encode_chunk};
    use relaydrop_protocol::{ErrorCode, ErrorPayload, FileInfo, Frame, MessageType, room_code};
    use relaydrop_resume::{RecordStore, ResumableTransferRecord};
    use relaydrop_transfer::Role;
    use relaydrop_transport::Rendezvous;

    /// Returns the path to the fixtures directory.
    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    fn load_fixture(name: &str) -> serde_json::Value {
        let path = fixtures_dir().join(name);
        let data = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()));
        serde_json::from_str(&data)
            .unwrap_or_else(|e| panic!("failed to parse fixture {}: {e}", path.display()))
    }

    fn bytes(hex_str: &str) -> Vec<u8> {
        let cleaned: String = hex_str.split_whitespace().collect();
        hex::decode(cleaned).expect("valid hex literal")
    }

    // --- Chunk header ---

    #[test]
    fn chunk_header_layout() {
        let payload = encode_chunk(7, b"hello world");
        // index, size, first 8 bytes of SHA-256("hello world"), data
        let expected = bytes(
            "00000007 0000000b b94d27b9934d3e08
             68656c6c6f20776f726c64",
        );
        assert_eq!(payload, expected);

        let (header, body) = decode_chunk(&expected).unwrap();
        assert_eq!(header.index, 7);
        assert_eq!(header.size, 11);
        assert_eq!(body, b"hello world");
    }

    #[test]
    fn empty_chunk_layout() {
        let header = ChunkHeader::for_payload(0, b"");
        assert_eq!(
            header.encode().to_vec(),
            bytes("00000000 00000000 e3b0c44298fc1c14")
        );
    }

    #[test]
    fn chunk_checksum_is_sha256_prefix() {
        assert_eq!(compute_checksum(b"abc").to_vec(), bytes("ba7816bf8f01cfea"));
    }

    // --- FileInfo ---

    #[test]
    fn file_info_layout() {
        let info = FileInfo::new("a.txt", 150_000, [0xAB; 32], 65536).unwrap();
        assert_eq!(info.total_chunks, 3);
        let expected = bytes(&format!(
            "0005 612e747874 00000000000249f0 {} 00000003 00010000 00",
            "ab".repeat(32)
        ));
        assert_eq!(info.encode().unwrap(), expected);
        assert_eq!(FileInfo::decode(&expected).unwrap(), info);
    }

    #[test]
    fn compressed_file_info_layout() {
        let mut info = FileInfo::new("z", 10, [0x01; 32], 4096).unwrap();
        info.compressed = true;
        info.compressed_size = 6;
        let expected = bytes(&format!(
            "0001 7a 000000000000000a {} 00000001 00001000 01 0000000000000006",
            "01".repeat(32)
        ));
        assert_eq!(info.encode().unwrap(), expected);
        assert_eq!(FileInfo::decode(&expected).unwrap(), info);
    }

    #[test]
    fn zero_byte_file_info_has_one_chunk() {
        let info = FileInfo::new("empty", 0, [0; 32], 65536).unwrap();
        let encoded = info.encode().unwrap();
        // total_chunks follows name, size and checksum
        let at = 2 + 5 + 8 + 32;
        assert_eq!(&encoded[at..at + 4], &[0, 0, 0, 1]);
    }

    // --- Frames ---

    #[test]
    fn message_type_tags() {
        let tags = [
            (MessageType::Hello, 0x01),
            (MessageType::HelloAck, 0x02),
            (MessageType::PakeMsg1, 0x10),
            (MessageType::PakeMsg2, 0x11),
            (MessageType::PakeConfirm, 0x12),
            (MessageType::FileInfo, 0x30),
            (MessageType::FileInfoAck, 0x31),
            (MessageType::Chunk, 0x40),
            (MessageType::Done, 0x50),
            (MessageType::DoneAck, 0x51),
            (MessageType::Error, 0xF0),
            (MessageType::Cancel, 0xFF),
        ];
        for (msg_type, tag) in tags {
            assert_eq!(u8::from(msg_type), tag, "{msg_type:?}");
        }
    }

    #[test]
    fn file_info_ack_frame_layout() {
        let frame = Frame::new(MessageType::FileInfoAck, 2u32.to_be_bytes());
        assert_eq!(frame.encode(), bytes("31 00000004 00000002"));
    }

    #[test]
    fn cancel_frame_layout() {
        assert_eq!(Frame::empty(MessageType::Cancel).encode(), bytes("ff 00000000"));
    }

    #[test]
    fn done_frame_carries_file_digest() {
        let frame = Frame::new(MessageType::Done, vec![0xCD; 32]);
        let expected = bytes(&format!("50 00000020 {}", "cd".repeat(32)));
        assert_eq!(frame.encode(), expected);
        assert_eq!(Frame::decode(&expected).unwrap(), frame);
    }

    #[test]
    fn chunk_frame_nests_chunk_payload() {
        let frame = Frame::new(MessageType::Chunk, encode_chunk(0, b"abc"));
        let expected = bytes("40 00000013 00000000 00000003 ba7816bf8f01cfea 616263");
        assert_eq!(frame.encode(), expected);
    }

    // --- Error payload ---

    #[test]
    fn error_payload_layout() {
        let payload = ErrorPayload::new(ErrorCode::Hash, "bad chunk 1");
        let expected = bytes("0004 000b 626164206368756e6b2031");
        assert_eq!(payload.encode(), expected);
        assert_eq!(ErrorPayload::decode(&expected).unwrap(), payload);
    }

    #[test]
    fn error_codes() {
        let codes = [
            (ErrorCode::Unknown, 0),
            (ErrorCode::Version, 1),
            (ErrorCode::Auth, 2),
            (ErrorCode::Transfer, 3),
            (ErrorCode::Hash, 4),
            (ErrorCode::Cancelled, 5),
            (ErrorCode::RoomNotFound, 6),
            (ErrorCode::RoomFull, 7),
            (ErrorCode::Protocol, 8),
        ];
        for (code, value) in codes {
            assert_eq!(code as u16, value);
            assert_eq!(ErrorCode::from_u16(value), code);
        }
        assert_eq!(ErrorCode::from_u16(0x1234), ErrorCode::Unknown);
    }

    // --- Room codes ---

    #[test]
    fn room_id_hashes_normalized_code() {
        assert_eq!(room_code::room_id(" ABC "), "ba7816bf8f01cfea414140de5dae2223");
    }

    // --- Persisted records ---

    #[test]
    fn fixture_transfer_records_roundtrip() {
        let fixture = load_fixture("transfers.json");
        let parsed: HashMap<String, ResumableTransferRecord> =
            serde_json::from_value(fixture.clone())
                .unwrap_or_else(|e| panic!("failed to deserialize transfers.json: {e}"));
        let reserialized = serde_json::to_value(&parsed).unwrap();
        assert_eq!(
            fixture, reserialized,
            "roundtrip mismatch:\n  fixture: {fixture}\n  rust:    {reserialized}"
        );
    }

    #[test]
    fn fixture_transfer_records_load() {
        let store = RecordStore::open(fixtures_dir().join("transfers.json")).unwrap();
        assert_eq!(store.list().len(), 2);

        let receiver = store.get("5f0c1a52-8a51-4a47-9d0e-2c9a3f6b7e10").unwrap();
        assert_eq!(receiver.role, Role::Receiver);
        assert_eq!(receiver.watermark(), 2);
        assert_eq!(receiver.resume_attempts, 1);
        assert_eq!(
            receiver.rendezvous,
            Rendezvous::Room {
                code: "acid-basin-coast".into()
            }
        );

        let sender = store.get("c2d9e0f4-3b7a-4f1e-8c55-91a0b7d6e234").unwrap();
        assert_eq!(sender.role, Role::Sender);
        assert_eq!(sender.watermark(), 9);
        assert_eq!(sender.chunks.len(), 9);
        assert!(sender.source_path.is_some());
        assert!(matches!(sender.rendezvous, Rendezvous::Direct { .. }));
    }
}
