//! Property-based codec tests for the hub wire protocol.
//!
//! Uses proptest to verify:
//! 1. Any `HubMessage` survives an encode → decode cycle.
//! 2. Random bytes never cause a panic in `decode` (returns `Err` gracefully).
//! 3. Any `TypingSignal` payload decodes back to the same signal.

use classchat_proto::codec;
use classchat_proto::hub::{HubMessage, RpcCall, RpcFailure, RpcResponse, ThreadChange, Topic};
use classchat_proto::message::{MessageId, ThreadId, ThreadMessage, Timestamp, UserId};
use classchat_proto::typing::TypingSignal;
use proptest::prelude::*;
use uuid::Uuid;

fn arb_thread_id() -> impl Strategy<Value = ThreadId> {
    any::<u128>().prop_map(|n| ThreadId::from_uuid(Uuid::from_u128(n)))
}

fn arb_message_id() -> impl Strategy<Value = MessageId> {
    any::<u128>().prop_map(|n| MessageId::from_uuid(Uuid::from_u128(n)))
}

fn arb_user_id() -> impl Strategy<Value = UserId> {
    "[a-z0-9-]{1,36}".prop_map(UserId::new)
}

fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
    any::<u64>().prop_map(Timestamp::from_millis)
}

fn arb_thread_message() -> impl Strategy<Value = ThreadMessage> {
    (
        arb_message_id(),
        arb_thread_id(),
        arb_user_id(),
        ".{0,32}",
        ".{1,256}",
        arb_timestamp(),
        proptest::option::of(arb_timestamp()),
        proptest::option::of(arb_timestamp()),
    )
        .prop_map(
            |(id, thread_id, sender_id, sender_name, body, created_at, delivered_at, read_at)| {
                ThreadMessage {
                    id,
                    thread_id,
                    sender_id,
                    sender_name,
                    body,
                    created_at,
                    delivered_at,
                    read_at,
                }
            },
        )
}

fn arb_change() -> impl Strategy<Value = ThreadChange> {
    prop_oneof![
        arb_thread_message().prop_map(ThreadChange::MessageInserted),
        (
            arb_thread_id(),
            arb_user_id(),
            prop::collection::vec(arb_message_id(), 0..8),
            arb_timestamp()
        )
            .prop_map(|(thread_id, recipient, message_ids, at)| {
                ThreadChange::MessagesDelivered {
                    thread_id,
                    recipient,
                    message_ids,
                    at,
                }
            }),
    ]
}

fn arb_hub_message() -> impl Strategy<Value = HubMessage> {
    prop_oneof![
        arb_user_id().prop_map(|client_id| HubMessage::Hello { client_id }),
        "[a-z:0-9-]{1,48}".prop_map(|t| HubMessage::Subscribe { topic: Topic::new(t) }),
        ("[a-z:0-9-]{1,48}", ".{0,64}").prop_map(|(t, reason)| HubMessage::Refused {
            topic: Topic::new(t),
            reason,
        }),
        (
            arb_user_id(),
            ".{0,16}",
            prop::collection::vec(any::<u8>(), 0..256)
        )
            .prop_map(|(from, event, payload)| HubMessage::Broadcast {
                topic: Topic::new("typing:x"),
                from,
                event,
                payload,
            }),
        (any::<u64>(), arb_thread_id()).prop_map(|(request_id, thread_id)| HubMessage::Call {
            request_id,
            call: RpcCall::MarkMessagesDelivered { thread_id },
        }),
        (any::<u64>(), prop::collection::vec(arb_message_id(), 0..8)).prop_map(
            |(request_id, ids)| HubMessage::Reply {
                request_id,
                result: Ok(RpcResponse::Marked(ids)),
            }
        ),
        (any::<u64>(), arb_thread_id()).prop_map(|(request_id, thread_id)| HubMessage::Reply {
            request_id,
            result: Err(RpcFailure::UnknownThread(thread_id)),
        }),
        arb_change().prop_map(|change| HubMessage::Change {
            topic: Topic::new("thread:x"),
            change,
        }),
    ]
}

proptest! {
    /// Any hub frame survives an encode → decode cycle.
    #[test]
    fn hub_message_round_trip(msg in arb_hub_message()) {
        let bytes = codec::encode(&msg).expect("encode should succeed");
        let decoded: HubMessage = codec::decode(&bytes).expect("decode should succeed");
        prop_assert_eq!(msg, decoded);
    }

    /// Random bytes never cause a panic when decoded as a hub frame.
    #[test]
    fn random_bytes_never_panic(data in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = codec::decode::<HubMessage>(&data);
    }

    /// Random bytes never cause a panic when decoded as a typing payload.
    #[test]
    fn random_typing_payload_never_panics(data in prop::collection::vec(any::<u8>(), 0..128)) {
        let _ = codec::decode::<TypingSignal>(&data);
    }

    /// Typing signals decode back to the value that was broadcast.
    #[test]
    fn typing_signal_round_trip(
        user_id in arb_user_id(),
        user_name in ".{0,32}",
        timestamp in arb_timestamp(),
        is_typing in any::<bool>(),
    ) {
        let signal = TypingSignal { user_id, user_name, timestamp, is_typing };
        let bytes = codec::encode(&signal).expect("encode should succeed");
        let decoded: TypingSignal = codec::decode(&bytes).expect("decode should succeed");
        prop_assert_eq!(signal, decoded);
    }
}
