//! Configuration structure tests: defaults and JSON deserialization.

use pqctl_core::config::*;
use pretty_assertions::assert_eq;

#[test]
fn test_config_defaults() {
    let config = Config::default();
    assert_eq!(config.interface, Interface::Auto);
    assert_eq!(config.verbose, Verbosity::Default);
    assert_eq!(config.l3_cdp, Toggle::Any);
    assert_eq!(config.l2_cdp, Toggle::Any);
    assert_eq!(config.mba_controller, Toggle::Any);
    assert_eq!(config.iordt, Toggle::Any);
    assert_eq!(config.snc, SncMode::Any);
    assert!(!config.reclaim_in_use_rmid);
}

#[test]
fn test_config_from_json() {
    let json = r#"{
        "interface": "Register",
        "verbose": "Verbose",
        "l3_cdp": "On",
        "mba_controller": "Off",
        "snc": "Local",
        "reclaim_in_use_rmid": true
    }"#;
    let config: Config = serde_json::from_str(json).unwrap();
    assert_eq!(config.interface, Interface::Register);
    assert_eq!(config.verbose, Verbosity::Verbose);
    assert_eq!(config.l3_cdp, Toggle::On);
    assert_eq!(config.l2_cdp, Toggle::Any);
    assert_eq!(config.mba_controller, Toggle::Off);
    assert_eq!(config.snc, SncMode::Local);
    assert!(config.reclaim_in_use_rmid);
}

#[test]
fn test_interface_aliases() {
    let config: Config = serde_json::from_str(r#"{ "interface": "MSR" }"#).unwrap();
    assert_eq!(config.interface, Interface::Register);
    let config: Config = serde_json::from_str(r#"{ "interface": "OS" }"#).unwrap();
    assert_eq!(config.interface, Interface::Filesystem);
}

#[test]
fn test_empty_json_is_default() {
    let config: Config = serde_json::from_str("{}").unwrap();
    assert_eq!(config.interface, Interface::Auto);
    assert!(!config.reclaim_in_use_rmid);
}

#[test]
fn test_retry_budget_is_bounded() {
    assert_eq!(UNAVAILABLE_RETRIES, 3);
    assert_eq!(DEFAULT_MBM_COUNTER_WIDTH, 24);
}
