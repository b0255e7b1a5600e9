use proptest::prelude::*;
use sentra_core::monitor::MonitorEntry;
use sentra_core::types::{Policy, PolicyDescription, PolicyKey, PolicyResult, PolicyType};
use wire::{AgentMsgType, BinaryQueue, Message, ResponseCode, WireError, HEADER_SIZE};

fn key() -> PolicyKey {
    PolicyKey::new("client", "user", "privilege")
}

fn every_message() -> Vec<Message> {
    vec![
        Message::CheckPolicyRequest { key: key() },
        Message::CheckPolicyResponse { result: PolicyResult::allow() },
        Message::CancelRequest,
        Message::CancelResponse,
        Message::SimpleCheckRequest { key: key() },
        Message::SimpleCheckResponse {
            code: ResponseCode::Ok,
            result: PolicyResult::new(PolicyType(0x0010), "payload"),
        },
        Message::MonitorEntryPut {
            entry: MonitorEntry::new(key(), PolicyType::DENY, 1_700_000_000_000),
        },
        Message::InsertOrUpdateBucket {
            bucket: "cam".into(),
            default_result: PolicyResult::deny(),
        },
        Message::RemoveBucket { bucket: "cam".into(), recursive: true },
        Message::SetPolicies {
            insert_or_update: vec![
                (
                    String::new(),
                    vec![
                        Policy::new(key(), PolicyResult::allow()),
                        Policy::new(PolicyKey::any(), PolicyResult::bucket("cam")),
                    ],
                ),
                ("cam".into(), vec![]),
            ],
            remove: vec![("cam".into(), vec![key()])],
        },
        Message::CodeResponse { code: ResponseCode::DbCorrupted },
        Message::AdminCheckRequest { key: key(), start_bucket: "cam".into(), recursive: false },
        Message::ListRequest { bucket: String::new(), filter: PolicyKey::any() },
        Message::ListResponse {
            policies: vec![Policy::new(key(), PolicyResult::none())],
            bucket_valid: true,
            db_corrupted: false,
        },
        Message::AdminCheckPolicyResponse {
            result: PolicyResult::bucket("cam"),
            bucket_valid: true,
            db_corrupted: true,
        },
        Message::EraseRequest {
            start_bucket: String::new(),
            recursive: true,
            filter: PolicyKey::new("*", "user", "*"),
        },
        Message::DescriptionListRequest,
        Message::DescriptionListResponse {
            descriptions: vec![
                PolicyDescription::new(PolicyType::ALLOW, "allow"),
                PolicyDescription::new(PolicyType(0x0010), "ask-agent"),
            ],
            db_corrupted: false,
        },
        Message::MonitorGetEntriesRequest { max_entries: 64 },
        Message::MonitorGetEntriesResponse {
            entries: vec![MonitorEntry::new(key(), PolicyType::ALLOW, 42)],
        },
        Message::AgentRegisterRequest { agent_type: "popup".into() },
        Message::AgentRegisterResponse { code: ResponseCode::Ok },
        Message::AgentActionRequest { msg_type: AgentMsgType::Action, data: vec![1, 2, 3] },
        Message::AgentActionResponse { msg_type: AgentMsgType::Cancel, data: vec![] },
    ]
}

#[test]
fn every_operation_round_trips() {
    for (i, msg) in every_message().into_iter().enumerate() {
        let seq = i as u16;
        let frame = msg.encode(seq);
        let mut q = BinaryQueue::new();
        q.append(&frame);
        let (got_seq, got) = Message::decode(&mut q).unwrap().unwrap();
        assert_eq!(got_seq, seq);
        assert_eq!(got, msg);
        assert!(q.is_empty(), "decoder left bytes for {:?}", got.opcode());
    }
}

#[test]
fn encoded_length_matches_declared_payload() {
    for msg in every_message() {
        let frame = msg.encode(7);
        let declared =
            u32::from_le_bytes([frame[8], frame[9], frame[10], frame[11]]) as usize;
        assert_eq!(frame.len(), declared + HEADER_SIZE);
    }
}

#[test]
fn flipped_signature_byte_is_invalid_signature() {
    let mut frame = Message::CheckPolicyRequest { key: PolicyKey::new("c", "u", "p") }.encode(7);
    frame[3] ^= 0x20;
    let mut q = BinaryQueue::new();
    q.append(&frame);
    assert_eq!(Message::decode(&mut q), Err(WireError::InvalidSignature));
}

#[test]
fn unknown_opcode_is_wrong_opcode() {
    let mut frame = Message::CancelRequest.encode(1);
    frame[12] = 19;
    let mut q = BinaryQueue::new();
    q.append(&frame);
    assert_eq!(Message::decode(&mut q), Err(WireError::WrongOpCode));
}

#[test]
fn shortened_payload_is_truncated() {
    let frame = Message::CheckPolicyRequest { key: key() }.encode(3);
    // Keep the header consistent while dropping the payload's last byte.
    let declared = u32::from_le_bytes([frame[8], frame[9], frame[10], frame[11]]) - 1;
    let mut cut = frame[..frame.len() - 1].to_vec();
    cut[8..12].copy_from_slice(&declared.to_le_bytes());
    let mut q = BinaryQueue::new();
    q.append(&cut);
    assert_eq!(Message::decode(&mut q), Err(WireError::Truncated));
}

#[test]
fn padded_payload_is_trailing_bytes() {
    let frame = Message::CancelRequest.encode(3);
    let mut padded = frame.clone();
    padded.push(0xAB);
    let declared = u32::from_le_bytes([frame[8], frame[9], frame[10], frame[11]]) + 1;
    padded[8..12].copy_from_slice(&declared.to_le_bytes());
    let mut q = BinaryQueue::new();
    q.append(&padded);
    assert_eq!(Message::decode(&mut q), Err(WireError::TrailingBytes));
}

#[test]
fn split_delivery_decodes_once_complete() {
    let frame = Message::CheckPolicyRequest { key: key() }.encode(11);
    let mut q = BinaryQueue::new();
    let (a, b) = frame.split_at(frame.len() / 2);
    q.append(a);
    assert_eq!(Message::decode(&mut q).unwrap(), None);
    q.append(b);
    let (seq, msg) = Message::decode(&mut q).unwrap().unwrap();
    assert_eq!(seq, 11);
    assert_eq!(msg, Message::CheckPolicyRequest { key: key() });
}

#[test]
fn back_to_back_frames_decode_in_order() {
    let mut q = BinaryQueue::new();
    q.append(&Message::CancelRequest.encode(1));
    q.append(&Message::DescriptionListRequest.encode(2));
    let (s1, m1) = Message::decode(&mut q).unwrap().unwrap();
    let (s2, m2) = Message::decode(&mut q).unwrap().unwrap();
    assert_eq!((s1, m1), (1, Message::CancelRequest));
    assert_eq!((s2, m2), (2, Message::DescriptionListRequest));
    assert_eq!(Message::decode(&mut q).unwrap(), None);
}

fn identifier() -> impl Strategy<Value = String> {
    proptest::string::string_regex("[ -:<-~]{0,24}").unwrap()
}

proptest! {
    #[test]
    fn arbitrary_check_requests_round_trip(
        client in identifier(),
        user in identifier(),
        privilege in identifier(),
        seq in any::<u16>(),
    ) {
        let msg = Message::CheckPolicyRequest {
            key: PolicyKey::new(client, user, privilege),
        };
        let mut q = BinaryQueue::new();
        q.append(&msg.encode(seq));
        let (got_seq, got) = Message::decode(&mut q).unwrap().unwrap();
        prop_assert_eq!(got_seq, seq);
        prop_assert_eq!(got, msg);
    }

    #[test]
    fn arbitrary_results_round_trip(
        tag in any::<u16>(),
        metadata in identifier(),
        seq in any::<u16>(),
    ) {
        let msg = Message::CheckPolicyResponse {
            result: PolicyResult::new(PolicyType(tag), metadata),
        };
        let mut q = BinaryQueue::new();
        q.append(&msg.encode(seq));
        let (_, got) = Message::decode(&mut q).unwrap().unwrap();
        prop_assert_eq!(got, msg);
    }
}
