use tether_network::protocol::MessageStats;
use tether_state::sync::timestamp_now;

#[test]
fn update_rtt_sets_value_when_now_after_sent() {
    let mut stats = MessageStats::default();
    let past = timestamp_now().saturating_sub(10_000);
    stats.update_rtt(past);
    assert!(stats.last_rtt_micros.unwrap() >= 10_000);
}

#[test]
fn update_rtt_ignores_future_timestamps() {
    let mut stats = MessageStats::default();
    stats.update_rtt(timestamp_now() + 60_000_000);
    assert_eq!(stats.last_rtt_micros, None);
}
