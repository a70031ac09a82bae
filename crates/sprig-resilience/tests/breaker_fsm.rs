//! The full breaker state walk: closed, open on repeated failures,
//! fail-fast while open, half-open after the reset timeout, closed again
//! after the probe successes.

use std::sync::Arc;
use std::time::Duration;

use sprig_resilience::{BreakerConfig, BreakerRegistry, CircuitBreaker, CircuitState, ErrorMonitor};

fn config() -> BreakerConfig {
    BreakerConfig {
        max_failures: 3,
        reset_timeout: Duration::from_secs(1),
        half_open_max_attempts: 2,
        health_check_interval: Duration::from_secs(30),
    }
}

async fn failing_call(breaker: &CircuitBreaker) -> bool {
    breaker
        .execute(|| async { Err::<(), _>("backend unavailable".to_string()) })
        .await
        .is_ok()
}

async fn ok_call(breaker: &CircuitBreaker) -> bool {
    breaker.execute(|| async { Ok::<_, String>(()) }).await.is_ok()
}

#[tokio::test]
async fn full_state_walk() {
    let monitor = Arc::new(ErrorMonitor::default());
    let registry = BreakerRegistry::new(config(), Some(monitor.clone()));
    let breaker = registry.get("nutrient-doser");

    // Three failing calls trip the circuit.
    for _ in 0..3 {
        assert!(failing_call(&breaker).await, "call passes through while closed");
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    // While open, the next call is rejected without running.
    assert!(!ok_call(&breaker).await);

    // After the reset timeout the next call probes in half-open.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(ok_call(&breaker).await);
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    // A second consecutive success closes the circuit.
    assert!(ok_call(&breaker).await);
    assert_eq!(breaker.state(), CircuitState::Closed);

    // The open-circuit rejection reached the error monitor.
    let faults = monitor
        .active_errors(Some(&sprig_domain::DeviceId::SYSTEM))
        .await;
    assert!(faults.iter().any(|f| f.code == "recovery.circuit_open"));
}

#[tokio::test]
async fn half_open_failure_goes_straight_back_to_open() {
    let registry = BreakerRegistry::new(
        BreakerConfig {
            reset_timeout: Duration::from_millis(100),
            ..config()
        },
        None,
    );
    let breaker = registry.get("dosing-valve");

    for _ in 0..3 {
        failing_call(&breaker).await;
    }
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert!(failing_call(&breaker).await, "half-open probe runs");
    assert_eq!(breaker.state(), CircuitState::Open);

    // And the fresh open period rejects again.
    assert!(!ok_call(&breaker).await);
}
