//! End-to-end surface tests: spawning the link against an unclaimed
//! directory, feeding inbound messages through the dispatcher, and shutting
//! down cleanly. No network is touched; the lifecycle idles in its
//! claim-wait state throughout.

use std::path::PathBuf;
use std::time::Duration;

use prost::Message as _;

use cloudlink::config::LinkConfig;
use cloudlink::dispatch::router::Dispatcher;
use cloudlink::proto::agent::DisconnectReq;
use cloudlink::proto::context::ContextsUpdated;
use cloudlink::{Collaborators, LinkError, LinkHandle};

fn temp_claim_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("cloudlink-it-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn test_config(claim_dir: PathBuf) -> LinkConfig {
    LinkConfig {
        cloud_base_url: "https://cloud.invalid".into(),
        proxy: cloudlink::net::proxy::ProxySetting::None,
        statistics: true,
        claim_dir,
        machine_guid: uuid::Uuid::new_v4(),
        ..Default::default()
    }
}

#[tokio::test]
async fn spawn_reports_offline_and_shuts_down() {
    let claim_dir = temp_claim_dir();
    let link = LinkHandle::spawn(test_config(claim_dir.clone()), Collaborators::noop()).unwrap();

    let status = link.status();
    assert!(!status.online);
    assert_eq!(status.reconnect_count, 0);
    assert!(!status.banned_by_cloud);
    assert_eq!(status.cloud_base_url, "https://cloud.invalid/");

    // let the tasks run a little before tearing down
    tokio::time::sleep(Duration::from_millis(50)).await;
    link.shutdown().await;
    std::fs::remove_dir_all(&claim_dir).ok();
}

#[tokio::test]
async fn invalid_cloud_url_refuses_to_start() {
    let claim_dir = temp_claim_dir();
    let config = LinkConfig {
        cloud_base_url: "definitely not a url".into(),
        claim_dir: claim_dir.clone(),
        ..Default::default()
    };
    match LinkHandle::spawn(config, Collaborators::noop()) {
        Err(LinkError::Config(_)) => {}
        Err(e) => panic!("expected a configuration error, got {e}"),
        Ok(_) => panic!("expected a configuration error, got a running link"),
    }
    std::fs::remove_dir_all(&claim_dir).ok();
}

#[tokio::test]
async fn permaban_disables_the_link_until_restart() {
    let claim_dir = temp_claim_dir();
    let link = LinkHandle::spawn(test_config(claim_dir.clone()), Collaborators::noop()).unwrap();
    let shared = link.shared();

    let dispatcher = Dispatcher::new(Collaborators::noop()).unwrap();
    let ban = DisconnectReq {
        reconnect_after_seconds: 0,
        permaban: true,
        error_code: 17,
        error_description: "agent misbehaved".into(),
    };
    dispatcher.handle(&shared, "/agent/inbox/DisconnectReq", &ban.encode_to_vec());

    assert!(shared.is_disabled());
    assert!(shared.disconnect_requested());
    assert!(link.status().banned_by_cloud);

    link.shutdown().await;
    std::fs::remove_dir_all(&claim_dir).ok();
}

#[tokio::test]
async fn context_updates_flow_through_the_producer_surface() {
    let claim_dir = temp_claim_dir();
    let link = LinkHandle::spawn(test_config(claim_dir.clone()), Collaborators::noop()).unwrap();

    let accepted = link.push_contexts_updated(ContextsUpdated {
        claim_id: "claim-1".into(),
        node_id: "node-1".into(),
        version_hash: 7,
        contexts: vec![],
    });
    assert!(accepted.is_ok());

    link.shutdown().await;
    std::fs::remove_dir_all(&claim_dir).ok();
}

#[tokio::test]
async fn unknown_inbound_name_is_counted_not_crashed() {
    let claim_dir = temp_claim_dir();
    let link = LinkHandle::spawn(test_config(claim_dir.clone()), Collaborators::noop()).unwrap();
    let shared = link.shared();

    let dispatcher = Dispatcher::new(Collaborators::noop()).unwrap();
    dispatcher.handle(&shared, "/agent/inbox/NoSuchThing", b"whatever");

    let status = link.status();
    let stats = status.stats.expect("statistics enabled");
    assert_eq!(stats.cloud_req_err, 1);
    assert_eq!(stats.cloud_req_recvd, 1);
    assert!(!status.online);

    link.shutdown().await;
    std::fs::remove_dir_all(&claim_dir).ok();
}
