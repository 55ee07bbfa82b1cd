//! Property-based tests for the timing rules of the realtime layer.
//!
//! Uses proptest to verify:
//! 1. Reconnect delays follow `min(initial × 2^attempt, max)` and never shrink.
//! 2. The typing throttle never announces twice within one window.
//! 3. The typing roster sweep drops exactly the entries older than
//!    `timeout + grace`.
//! 4. The connection machine only leaves `Connected` for `Connecting` on
//!    foreground, and only leaves `Offline` on retry or foreground.

use std::time::Duration;

use classchat::connection::{
    ConnectionEvent, ConnectionMachine, ConnectionState, ReconnectConfig, reconnect_delay,
};
use classchat::typing::{TypingConfig, TypingRoster, TypingThrottle};
use classchat_proto::message::{Timestamp, UserId};
use classchat_proto::typing::TypingSignal;
use proptest::prelude::*;
use tokio::time::Instant;

fn arb_reconnect_config() -> impl Strategy<Value = ReconnectConfig> {
    (1u64..5_000, 0u64..600_000, proptest::option::of(0u32..20)).prop_map(
        |(initial_ms, extra_ms, max_attempts)| ReconnectConfig {
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(initial_ms + extra_ms),
            max_attempts,
        },
    )
}

fn arb_event() -> impl Strategy<Value = ConnectionEvent> {
    prop_oneof![
        Just(ConnectionEvent::Connected),
        Just(ConnectionEvent::Failed),
        Just(ConnectionEvent::RetryTimerFired),
        Just(ConnectionEvent::Foreground),
        Just(ConnectionEvent::RetryRequested),
    ]
}

fn typing(user: &str, is_typing: bool) -> TypingSignal {
    TypingSignal {
        user_id: UserId::new(user),
        user_name: user.to_uppercase(),
        timestamp: Timestamp::from_millis(0),
        is_typing,
    }
}

proptest! {
    #[test]
    fn reconnect_delay_formula(cfg in arb_reconnect_config(), attempt in 0u32..64) {
        let expected_ms = (cfg.initial_delay.as_millis() << attempt).min(cfg.max_delay.as_millis());
        prop_assert_eq!(reconnect_delay(&cfg, attempt).as_millis(), expected_ms);
    }

    #[test]
    fn reconnect_delay_is_monotonic_and_capped(
        cfg in arb_reconnect_config(),
        attempt in 0u32..200,
    ) {
        let here = reconnect_delay(&cfg, attempt);
        let next = reconnect_delay(&cfg, attempt.saturating_add(1));
        prop_assert!(here <= next);
        prop_assert!(next <= cfg.max_delay);
        prop_assert!(here >= cfg.initial_delay.min(cfg.max_delay));
    }

    #[test]
    fn throttle_spaces_announcements(gaps in proptest::collection::vec(0u64..3_000, 1..60)) {
        let config = TypingConfig::default();
        let mut throttle = TypingThrottle::new(config);
        let base = Instant::now();

        let mut at = base;
        let mut first_input = None;
        let mut announced: Vec<Instant> = Vec::new();
        for gap in gaps {
            at += Duration::from_millis(gap);
            first_input.get_or_insert(at);
            if throttle.on_input(at) {
                announced.push(at);
            }
        }

        // The first keystroke is always announced.
        prop_assert_eq!(announced.first().copied(), first_input);
        for pair in announced.windows(2) {
            prop_assert!(pair[1] - pair[0] >= config.throttle);
        }
    }

    #[test]
    fn throttle_deadline_tracks_last_input(gaps in proptest::collection::vec(0u64..3_000, 1..30)) {
        let config = TypingConfig::default();
        let mut throttle = TypingThrottle::new(config);
        let mut at = Instant::now();
        for gap in gaps {
            at += Duration::from_millis(gap);
            throttle.on_input(at);
        }
        prop_assert_eq!(throttle.deadline(), Some(at + config.timeout));
        prop_assert!(!throttle.poll_expired(at + config.timeout - Duration::from_millis(1)));
        prop_assert!(throttle.poll_expired(at + config.timeout));
        prop_assert!(!throttle.poll_expired(at + config.timeout * 10));
    }

    #[test]
    fn roster_sweep_drops_only_stale(ages in proptest::collection::vec(0u64..10_000, 0..20)) {
        let config = TypingConfig::default();
        let max_age = config.timeout + config.stale_grace;
        let mut roster = TypingRoster::new(UserId::new("me"), &config);
        let now = Instant::now() + Duration::from_secs(60);

        for (i, age) in ages.iter().enumerate() {
            let user = format!("user-{i}");
            let seen_at = now - Duration::from_millis(*age);
            roster.apply(&UserId::new(&user), &typing(&user, true), seen_at);
        }
        roster.sweep(now);

        let fresh = ages.iter().filter(|age| Duration::from_millis(**age) <= max_age).count();
        prop_assert_eq!(roster.users().len(), fresh);
        for user in roster.users() {
            prop_assert!(now - user.last_seen <= max_age);
        }
    }

    #[test]
    fn machine_transitions_respect_rules(
        cfg in arb_reconnect_config(),
        events in proptest::collection::vec(arb_event(), 1..80),
    ) {
        let mut machine = ConnectionMachine::new(cfg);
        for event in events {
            let before = machine.status();
            let after = machine.apply(event);

            if before.state == ConnectionState::Connected
                && after.state == ConnectionState::Connecting
            {
                prop_assert_eq!(event, ConnectionEvent::Foreground);
            }
            if before.state == ConnectionState::Offline && after.state != ConnectionState::Offline {
                prop_assert!(matches!(
                    event,
                    ConnectionEvent::RetryRequested | ConnectionEvent::Foreground
                ));
                prop_assert_eq!(after.attempt, 0);
            }
            prop_assert_eq!(after.retry_in.is_some(), after.state == ConnectionState::Disconnected);
            if let Some(delay) = after.retry_in {
                prop_assert_eq!(delay, reconnect_delay(&cfg, after.attempt));
            }
            if let Some(max) = cfg.max_attempts {
                prop_assert!(after.attempt <= max);
            }
            if after.state == ConnectionState::Connected {
                prop_assert_eq!(after.attempt, 0);
            }
        }
    }
}
