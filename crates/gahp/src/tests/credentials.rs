//! Credential cache behavior: upload thresholds, active-credential
//! switching, eviction, and the refresh sweep.

use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use crate::{
    credentials::{Credential, CredentialChoice},
    server::Priority,
};

use super::support::{session, started_server, test_config};

fn proxy(path: &str, lifetime_secs: u64) -> Arc<Credential> {
    Credential::new(path, SystemTime::now() + Duration::from_secs(lifetime_secs))
}

#[tokio::test]
async fn initialize_primes_the_helper_with_the_master() {
    let config = test_config();
    let (server, helper) = started_server(&config).await;
    let master = proxy("/tmp/master.pem", 3600);

    server.initialize(Some(master)).await.unwrap();
    assert!(server.is_initialized().await);

    assert_eq!(
        helper.lines_with("INITIALIZE_FROM_FILE")[0][1],
        "/tmp/master.pem"
    );
    let cached = helper.lines_with("CACHE_PROXY_FROM_FILE");
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0][1], "1");
    assert_eq!(cached[0][2], "/tmp/master.pem");

    // Initializing again is a no-op.
    server.initialize(None).await.unwrap();
    assert_eq!(helper.calls("INITIALIZE_FROM_FILE"), 1);
}

#[tokio::test]
async fn commands_without_a_credential_keep_the_master_active() {
    let config = test_config();
    let (server, helper) = started_server(&config).await;
    server
        .initialize(Some(proxy("/tmp/master.pem", 3600)))
        .await
        .unwrap();

    let mut session = session(&server, &config);
    session
        .submit("TEST_PING", &[], Priority::Medium, CredentialChoice::NoCredential)
        .await
        .unwrap();

    // The master is already active and fresh; no credential traffic.
    assert_eq!(helper.calls("USE_CACHED_PROXY"), 0);
    assert_eq!(helper.calls("CACHE_PROXY_FROM_FILE"), 1);
}

#[tokio::test]
async fn credential_is_reuploaded_only_when_expiration_advances() {
    let config = test_config();
    let (server, helper) = started_server(&config).await;
    server
        .initialize(Some(proxy("/tmp/master.pem", 3600)))
        .await
        .unwrap();

    let alice = proxy("/tmp/alice.pem", 1800);
    server.register_credential(&alice).await.unwrap();
    let cached = helper.lines_with("CACHE_PROXY_FROM_FILE");
    assert_eq!(cached.len(), 2);
    assert_eq!(cached[1][1], "2");
    assert_eq!(cached[1][2], "/tmp/alice.pem");

    let mut session = session(&server, &config);
    session.set_normal_credential(Some(alice.clone()));

    // First dispatch under this credential switches the helper to it.
    session
        .submit("TEST_SUBMIT", &[], Priority::Medium, CredentialChoice::Normal)
        .await
        .unwrap();
    let switches = helper.lines_with("USE_CACHED_PROXY");
    assert_eq!(switches.len(), 1);
    assert_eq!(switches[0][1], "2");

    let (reqid, _) = helper.dispatched()[0].clone();
    helper.complete(reqid, &["S"]).await;
    server.poll().await.unwrap();
    session.poll_result().await.unwrap();

    // Unchanged expiration: already active, no re-upload, no re-switch.
    session
        .submit("TEST_STATUS", &[], Priority::Medium, CredentialChoice::Normal)
        .await
        .unwrap();
    assert_eq!(helper.calls("CACHE_PROXY_FROM_FILE"), 2);
    assert_eq!(helper.calls("USE_CACHED_PROXY"), 1);

    let (reqid, _) = helper.dispatched()[1].clone();
    helper.complete(reqid, &["S"]).await;
    server.poll().await.unwrap();
    session.poll_result().await.unwrap();

    // A renewed expiration crosses the threshold and forces a re-upload
    // under the same cache id.
    alice.renew(SystemTime::now() + Duration::from_secs(7200));
    session
        .submit("TEST_CANCEL", &[], Priority::Medium, CredentialChoice::Normal)
        .await
        .unwrap();
    let cached = helper.lines_with("CACHE_PROXY_FROM_FILE");
    assert_eq!(cached.len(), 3);
    assert_eq!(cached[2][1], "2");
    assert_eq!(helper.calls("USE_CACHED_PROXY"), 1);
}

#[tokio::test]
async fn evicting_the_active_credential_switches_to_the_master_first() {
    let config = test_config();
    let (server, helper) = started_server(&config).await;
    server
        .initialize(Some(proxy("/tmp/master.pem", 3600)))
        .await
        .unwrap();

    let alice = proxy("/tmp/alice.pem", 1800);
    server.register_credential(&alice).await.unwrap();

    let mut session = session(&server, &config);
    session.set_normal_credential(Some(alice.clone()));
    session
        .submit("TEST_PING", &[], Priority::Medium, CredentialChoice::Normal)
        .await
        .unwrap();
    assert_eq!(helper.lines_with("USE_CACHED_PROXY")[0][1], "2");

    server.release_credential(&alice).await.unwrap();

    let log = helper.log();
    let switch_back = log
        .iter()
        .rposition(|argv| {
            argv.first().map(String::as_str) == Some("USE_CACHED_PROXY")
                && argv.get(1).map(String::as_str) == Some("1")
        })
        .expect("switched back to the master");
    let uncache = log
        .iter()
        .position(|argv| argv.first().map(String::as_str) == Some("UNCACHE_PROXY"))
        .expect("evicted the credential");
    assert!(switch_back < uncache, "must switch away before evicting");
    assert_eq!(log[uncache][1], "2");
}

#[tokio::test]
async fn releasing_one_of_two_references_keeps_the_credential() {
    let config = test_config();
    let (server, helper) = started_server(&config).await;
    server
        .initialize(Some(proxy("/tmp/master.pem", 3600)))
        .await
        .unwrap();

    let alice = proxy("/tmp/alice.pem", 1800);
    server.register_credential(&alice).await.unwrap();
    server.register_credential(&alice).await.unwrap();
    // Second registration reuses the cache entry.
    assert_eq!(helper.calls("CACHE_PROXY_FROM_FILE"), 2);

    server.release_credential(&alice).await.unwrap();
    assert_eq!(helper.calls("UNCACHE_PROXY"), 0);
    server.release_credential(&alice).await.unwrap();
    assert_eq!(helper.calls("UNCACHE_PROXY"), 1);
}

#[tokio::test]
async fn refresh_sweep_reuploads_only_stale_credentials() {
    let config = test_config();
    let (server, helper) = started_server(&config).await;
    server
        .initialize(Some(proxy("/tmp/master.pem", 3600)))
        .await
        .unwrap();

    let alice = proxy("/tmp/alice.pem", 1800);
    server.register_credential(&alice).await.unwrap();
    assert_eq!(helper.calls("CACHE_PROXY_FROM_FILE"), 2);

    // Nothing stale: the sweep is quiet.
    server.refresh_credentials().await.unwrap();
    assert_eq!(helper.calls("CACHE_PROXY_FROM_FILE"), 2);

    alice.renew(SystemTime::now() + Duration::from_secs(7200));
    server.refresh_credentials().await.unwrap();
    let cached = helper.lines_with("CACHE_PROXY_FROM_FILE");
    assert_eq!(cached.len(), 3);
    assert_eq!(cached[2][1], "2");
}
