use std::time::Duration;

use corral::config::Config;
use corral::error::Error;

#[test]
fn defaults_match_documented_values() {
    let config = Config::default();

    assert!(config.database_url.is_none());
    assert_eq!(config.queue_poll_interval, Duration::from_secs(2));
    assert_eq!(config.invisibility_window, Duration::from_secs(15 * 60));
    assert_eq!(config.lease_heartbeat_interval, Duration::from_secs(5 * 60));
    assert_eq!(config.default_lock_timeout, Duration::from_secs(60));
    assert_eq!(config.lock_backoff, Duration::from_secs(2));
    assert_eq!(config.lock_ttl_grace, Duration::from_secs(15));
    assert_eq!(config.expiration_check_interval, Duration::from_secs(30 * 60));
    assert_eq!(config.counter_aggregate_interval, Duration::from_secs(2 * 60));
    assert_eq!(config.maintenance_lock_timeout, Duration::from_secs(5 * 60));
    assert_eq!(config.page_size, 100);
    assert_eq!(config.log_level, "info");
}

#[test]
fn from_env_reads_interval_overrides() {
    // Set overrides for this test
    unsafe {
        std::env::set_var("CORRAL_LOCK_BACKOFF_SECS", "1");
        std::env::set_var("CORRAL_LOCK_TTL_GRACE_SECS", "30");
    }

    let config = Config::from_env().unwrap();
    assert_eq!(config.lock_backoff, Duration::from_secs(1));
    assert_eq!(config.lock_ttl_grace, Duration::from_secs(30));

    // Clean up
    unsafe {
        std::env::remove_var("CORRAL_LOCK_BACKOFF_SECS");
        std::env::remove_var("CORRAL_LOCK_TTL_GRACE_SECS");
    }
}

#[test]
fn invalid_interval_is_a_config_error() {
    unsafe {
        std::env::set_var("CORRAL_INVISIBILITY_WINDOW_SECS", "soon");
    }

    let err = Config::from_env().unwrap_err();
    assert!(matches!(err, Error::Config(_)));

    unsafe {
        std::env::remove_var("CORRAL_INVISIBILITY_WINDOW_SECS");
    }
}

#[test]
fn option_views_carry_the_configured_intervals() {
    let mut config = Config::default();
    config.queue_poll_interval = Duration::from_millis(50);
    config.maintenance_lock_timeout = Duration::from_secs(10);

    assert_eq!(config.queue_options().poll_interval, Duration::from_millis(50));
    assert_eq!(config.sweeper_options().lock_timeout, Duration::from_secs(10));
    assert_eq!(config.aggregator_options().lock_timeout, Duration::from_secs(10));
}
