use duperagent::errors::ConfigError;
use duperagent::Agent;
use serde_json::json;

#[test]
fn configuration_locks_once_the_global_agent_exists() {
    duperagent::config(&json!({ "cache": false, "cookieJar": false })).unwrap();
    duperagent::config(&json!({ "cache": false, "cookieJar": false, "userAgent": "later/1" })).unwrap();

    let agent = Agent::global();
    assert!(agent.cookie_jar().is_none());
    assert!(std::ptr::eq(agent, Agent::global()));

    assert_eq!(
        duperagent::config(&json!({ "cookieJar": true })),
        Err(ConfigError::AlreadyInitialized)
    );
    assert!(Agent::global().cookie_jar().is_none());
}
