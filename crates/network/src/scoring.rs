//! # Gossipsub Peer Scoring Parameters
//!
//! Gossipsub scores every peer from a handful of per-topic counters. Tuning the raw
//! weights, caps and decays by hand is error prone, so every counter is instead
//! described by a target:
//!
//! - `score`: the points a peer gets (or loses, when negative) once the target is reached
//! - `duration`: how long a peer must behave to reach the target
//! - `min_rate` / `max_rate`: the expected message rate, in messages per second
//!
//! From these we derive:
//!
//! - `cap = min_rate × duration`, so a peer publishing at the minimum expected rate
//!   reaches exactly `score` after `duration`
//! - `decay = decay_to_zero ^ (decay_interval / duration)`, so that a counter left alone
//!   for `duration` decays to `decay_to_zero`
//! - `weight = score / cap` for linear counters and `score / cap²` for squared ones
//!
//! Invalid messages use a tolerance instead: a peer that sends `max_per_hour` invalid
//! messages within an hour loses `penalty` points.

use std::collections::HashMap;
use std::time::Duration;

use libp2p::gossipsub::{self, PeerScoreParams, PeerScoreThresholds, TopicHash, TopicScoreParams};
use pricefeed_config::{ScoreComponentConfig, ScoringConfig};

/// Counters in the mesh time component are measured in seconds.
const TIME_IN_MESH_QUANTUM: Duration = Duration::from_secs(1);

/// Window in which duplicate deliveries from mesh peers still count.
const MESH_MESSAGE_DELIVERIES_WINDOW: Duration = Duration::from_millis(10);

const HOUR: Duration = Duration::from_secs(3600);

/// Decay factor bringing a counter down to `decay_to_zero` after `duration`.
pub fn decay(decay_interval: Duration, duration: Duration, decay_to_zero: f64) -> f64 {
    let ticks = duration.as_secs_f64() / decay_interval.as_secs_f64();
    decay_to_zero.powf(1.0 / ticks)
}

/// Parameters of a counter that increases with each unit of good behaviour.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Linear {
    pub weight: f64,
    pub decay: f64,
    pub cap: f64,
}

/// Parameters of a counter whose deficit below `threshold` is squared.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Squared {
    pub weight: f64,
    pub decay: f64,
    pub cap: f64,
    pub threshold: f64,
}

/// Time spent in the mesh, counted in seconds, capped at the target duration.
pub fn time_in_mesh(component: &ScoreComponentConfig) -> Linear {
    let cap = component.duration.as_secs_f64() / TIME_IN_MESH_QUANTUM.as_secs_f64();

    Linear {
        weight: component.score / cap,
        decay: 0.0,
        cap,
    }
}

/// Messages first delivered by a peer.
pub fn first_message_deliveries(
    component: &ScoreComponentConfig,
    decay_interval: Duration,
    decay_to_zero: f64,
) -> Linear {
    let cap = component.min_rate * component.duration.as_secs_f64();

    Linear {
        weight: component.score / cap,
        decay: decay(decay_interval, component.duration, decay_to_zero),
        cap,
    }
}

/// Messages delivered by mesh peers, penalized below `min_rate`.
pub fn mesh_message_deliveries(
    component: &ScoreComponentConfig,
    decay_interval: Duration,
    decay_to_zero: f64,
) -> Squared {
    let duration = component.duration.as_secs_f64();
    let threshold = component.min_rate * duration;

    Squared {
        weight: component.score / (threshold * threshold),
        decay: decay(decay_interval, component.duration, decay_to_zero),
        cap: component.max_rate * duration,
        threshold,
    }
}

/// Delivery deficit kept after a peer is pruned from the mesh.
pub fn mesh_failure_penalty(
    component: &ScoreComponentConfig,
    decay_interval: Duration,
    decay_to_zero: f64,
) -> Squared {
    let threshold = component.min_rate * component.duration.as_secs_f64();

    Squared {
        weight: component.score / (threshold * threshold),
        decay: decay(decay_interval, component.duration, decay_to_zero),
        cap: 0.0,
        threshold,
    }
}

/// Invalid messages, squared, decaying over one hour.
pub fn invalid_messages(config: &ScoringConfig) -> (f64, f64) {
    let max = config.invalid_messages.max_per_hour;
    let weight = config.invalid_messages.penalty / (max * max);

    (
        weight,
        decay(config.decay_interval, HOUR, config.decay_to_zero),
    )
}

/// Score parameters applied to every subscribed topic.
pub fn topic_score_params(config: &ScoringConfig) -> TopicScoreParams {
    let (interval, to_zero) = (config.decay_interval, config.decay_to_zero);

    let time_in_mesh = time_in_mesh(&config.time_in_mesh);
    let first = first_message_deliveries(&config.first_message_deliveries, interval, to_zero);
    let mesh = mesh_message_deliveries(&config.mesh_message_deliveries, interval, to_zero);
    let failure = mesh_failure_penalty(&config.mesh_failure_penalty, interval, to_zero);
    let (invalid_weight, invalid_decay) = invalid_messages(config);

    TopicScoreParams {
        topic_weight: config.topic_weight,

        time_in_mesh_weight: time_in_mesh.weight,
        time_in_mesh_quantum: TIME_IN_MESH_QUANTUM,
        time_in_mesh_cap: time_in_mesh.cap,

        first_message_deliveries_weight: first.weight,
        first_message_deliveries_decay: first.decay,
        first_message_deliveries_cap: first.cap,

        mesh_message_deliveries_weight: mesh.weight,
        mesh_message_deliveries_decay: mesh.decay,
        mesh_message_deliveries_cap: mesh.cap,
        mesh_message_deliveries_threshold: mesh.threshold,
        mesh_message_deliveries_window: MESH_MESSAGE_DELIVERIES_WINDOW,
        mesh_message_deliveries_activation: config.mesh_message_deliveries.duration,

        mesh_failure_penalty_weight: failure.weight,
        mesh_failure_penalty_decay: failure.decay,

        invalid_message_deliveries_weight: invalid_weight,
        invalid_message_deliveries_decay: invalid_decay,
    }
}

/// Global score parameters, with the topic parameters installed for `topics`.
pub fn peer_score_params(
    config: &ScoringConfig,
    topics: impl IntoIterator<Item = TopicHash>,
) -> PeerScoreParams {
    let topic_params = topic_score_params(config);

    PeerScoreParams {
        topics: topics
            .into_iter()
            .map(|topic| (topic, topic_params.clone()))
            .collect::<HashMap<_, _>>(),
        decay_interval: config.decay_interval,
        decay_to_zero: config.decay_to_zero,
        ..Default::default()
    }
}

/// Constructs the peer score thresholds for GossipSub.
///
/// - `gossip`: peers below this don't receive gossip
/// - `publish`: peers below this are not sent our own messages
/// - `graylist`: peers below this are ignored entirely
pub fn peer_score_thresholds(config: &ScoringConfig) -> PeerScoreThresholds {
    let thresholds = &config.thresholds;

    PeerScoreThresholds {
        gossip_threshold: thresholds.gossip,
        publish_threshold: thresholds.publish,
        graylist_threshold: thresholds.graylist,
        accept_px_threshold: thresholds.accept_px,
        opportunistic_graft_threshold: thresholds.opportunistic_graft,
    }
}

/// Enable scoring on a gossipsub behaviour.
pub fn enable(behaviour: &mut gossipsub::Behaviour, config: &ScoringConfig) -> Result<(), String> {
    behaviour.with_peer_score(
        peer_score_params(config, []),
        peer_score_thresholds(config),
    )
}

#[cfg(test)]
mod tests {
    use pricefeed_config::InvalidMessagesConfig;

    use super::*;

    fn approx_eq(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9 * a.abs().max(b.abs()).max(1.0)
    }

    #[test]
    fn first_deliveries_reach_target_at_min_rate() {
        let component = ScoreComponentConfig::new(500.0, Duration::from_secs(15 * 60), 1.0, 10.0);
        let params = first_message_deliveries(&component, Duration::from_secs(1), 0.01);

        assert!(approx_eq(params.cap, 900.0));
        assert!(approx_eq(params.cap * params.weight, 500.0));
    }

    #[test]
    fn decay_reaches_decay_to_zero_after_duration() {
        let interval = Duration::from_secs(1);
        let duration = Duration::from_secs(600);

        let decay = decay(interval, duration, 0.01);
        let ticks = duration.as_secs_f64() / interval.as_secs_f64();

        assert!(decay > 0.0 && decay < 1.0);
        assert!(approx_eq(decay.powf(ticks), 0.01));
    }

    #[test]
    fn mesh_deliveries_squared_deficit_reaches_target() {
        let component =
            ScoreComponentConfig::new(-50.0, Duration::from_secs(600), 1.0 / 60.0, 1.0);
        let params = mesh_message_deliveries(&component, Duration::from_secs(1), 0.01);

        assert!(approx_eq(params.threshold, 10.0));
        assert!(approx_eq(params.cap, 600.0));
        assert!(approx_eq(params.weight * params.threshold.powi(2), -50.0));
    }

    #[test]
    fn time_in_mesh_is_counted_in_seconds() {
        let component = ScoreComponentConfig::new(10.0, Duration::from_secs(3600), 0.0, 0.0);
        let params = time_in_mesh(&component);

        assert!(approx_eq(params.cap, 3600.0));
        assert!(approx_eq(params.cap * params.weight, 10.0));
    }

    #[test]
    fn invalid_messages_tolerance() {
        let config = ScoringConfig {
            invalid_messages: InvalidMessagesConfig {
                penalty: -1000.0,
                max_per_hour: 10.0,
            },
            ..Default::default()
        };

        let (weight, decay) = invalid_messages(&config);
        assert!(approx_eq(weight * 100.0, -1000.0));
        assert!(decay > 0.0 && decay < 1.0);
    }

    #[test]
    fn default_config_produces_valid_params() {
        let config = ScoringConfig::default();

        let topic = gossipsub::IdentTopic::new("prices").hash();
        let params = peer_score_params(&config, [topic.clone()]);

        assert!(params.validate().is_ok());
        assert!(params.topics[&topic].validate().is_ok());
        assert!(peer_score_thresholds(&config).validate().is_ok());
    }
}
