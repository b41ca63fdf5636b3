//! Shared test helpers and generators for property-based testing.

use std::time::Duration;

use proptest::prelude::*;

use crate::backend::RetryConfig;
use crate::driver::{DriverConfig, PollConfig};
use crate::types::{FailureCause, StackName, StackSpec};

/// A stack with the given dependencies and a template named after it.
pub fn spec(name: &str, deps: &[&str]) -> StackSpec {
    let mut spec = StackSpec::new(name, format!("templates/{}.yaml", name));
    spec.depends_on = deps.iter().map(|d| StackName::from(*d)).collect();
    spec
}

/// Driver configuration with millisecond-scale waits.
pub fn fast_driver_config() -> DriverConfig {
    let poll = PollConfig {
        initial_interval: Duration::from_millis(1),
        growth: Duration::ZERO,
        max_interval: Duration::from_millis(2),
        timeout: Duration::from_secs(5),
        max_consecutive_errors: 3,
    };
    DriverConfig {
        deploy_poll: poll.clone(),
        rollback_poll: poll,
        retry: RetryConfig::new(3, Duration::from_millis(1), Duration::from_millis(4), 2.0),
        call_timeout: Duration::from_secs(5),
    }
}

/// Declarations of up to `max` stacks whose dependencies form a DAG.
///
/// Dependencies only point at lower-numbered stacks before the declaration
/// order is shuffled, so the generated graph is always acyclic while the
/// declaration order is arbitrary.
pub fn arb_acyclic_specs(max: usize) -> impl Strategy<Value = Vec<StackSpec>> {
    (0..=max)
        .prop_flat_map(|n| {
            (0..n)
                .map(|i| prop::collection::vec(any::<bool>(), i))
                .collect::<Vec<_>>()
        })
        .prop_map(|edges| {
            edges
                .iter()
                .enumerate()
                .map(|(i, row)| {
                    let deps: Vec<String> = row
                        .iter()
                        .enumerate()
                        .filter(|&(_, &edge)| edge)
                        .map(|(j, _)| format!("s{}", j))
                        .collect();
                    let deps: Vec<&str> = deps.iter().map(String::as_str).collect();
                    spec(&format!("s{}", i), &deps)
                })
                .collect::<Vec<_>>()
        })
        .prop_shuffle()
}

pub fn arb_failure_cause() -> impl Strategy<Value = FailureCause> {
    prop_oneof![
        "[a-zA-Z ]{1,40}".prop_map(|message| FailureCause::Rejected { message }),
        ("[A-Z_]{4,30}", prop::option::of("[a-zA-Z ]{1,40}"))
            .prop_map(|(status, reason)| FailureCause::BackendFailure { status, reason }),
        (1u64..7200).prop_map(|waited_secs| FailureCause::Timeout { waited_secs }),
        (1u32..10, "[a-zA-Z ]{1,40}")
            .prop_map(|(attempts, message)| FailureCause::RetriesExhausted { attempts, message }),
        Just(FailureCause::Cancelled),
        Just(FailureCause::NoKnownGoodState),
        Just(FailureCause::StackMissing),
    ]
}
