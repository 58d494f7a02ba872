//! End-to-end registration flows against an in-memory store and a fake
//! execution host

use anyhow::Result;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_test::assert_ok;
use url::Url;
use warden_config::WardenConfig;
use warden_core::testing::{FakeExecutionPeer, PeerBehavior, TestHarness};
use warden_core::{
    ContextEvent, EmbeddedWorkerStatus, ServiceWorkerContext, ServiceWorkerError, VersionStatus,
};
use warden_ipc::{ChannelExecutionHost, EventResult};
use warden_process::testing::FakeProcessProvider;

fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
}

fn drain(events: &mut mpsc::UnboundedReceiver<ContextEvent>) -> Vec<ContextEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

#[tokio::test]
async fn test_first_registration_walks_every_status() -> Result<()> {
    let harness = TestHarness::start().await;
    let mut events = harness.context.subscribe().await?;
    let pattern = url("https://example.com/app/*");

    let info = harness
        .context
        .register(pattern.clone(), url("https://example.com/app/sw.js"), None)
        .await?;
    assert_eq!(info.registration_id, 1);
    assert_eq!(info.active_version_id(), Some(1));

    let events = drain(&mut events);
    let statuses: Vec<VersionStatus> = events
        .iter()
        .filter_map(|event| match event {
            ContextEvent::VersionStatusChanged { status, .. } => Some(*status),
            _ => None,
        })
        .collect();
    assert_eq!(
        statuses,
        vec![
            VersionStatus::Installing,
            VersionStatus::Installed,
            VersionStatus::Activating,
            VersionStatus::Active,
        ]
    );
    assert!(events.iter().any(|event| matches!(
        event,
        ContextEvent::RegistrationStored { registration_id: 1, pattern: p } if *p == pattern
    )));
    assert!(events
        .iter()
        .any(|event| matches!(event, ContextEvent::WorkerStarted { version_id: 1, .. })));
    Ok(())
}

#[tokio::test]
async fn test_worker_starts_in_the_source_process() -> Result<()> {
    let harness = TestHarness::start().await;
    harness.provider.add_process(42);

    let info = harness
        .context
        .register(
            url("https://example.com/app/*"),
            url("https://example.com/app/sw.js"),
            Some(42),
        )
        .await?;

    let version = harness
        .context
        .version_info(info.active_version_id().unwrap())
        .await?;
    assert_eq!(version.process_id, Some(42));
    assert_eq!(version.running_status, EmbeddedWorkerStatus::Running);
    assert_eq!(harness.provider.worker_ref_count(42), 1);
    assert!(harness.provider.created_processes().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_different_scripts_for_one_pattern_run_in_order() -> Result<()> {
    let harness = TestHarness::start().await;
    let context = &harness.context;
    let pattern = url("https://example.com/app/*");

    let (first, second) = futures::join!(
        context.register(pattern.clone(), url("https://example.com/app/v1.js"), None),
        context.register(pattern.clone(), url("https://example.com/app/v2.js"), None),
    );
    assert_eq!(first?.registration_id, 1);
    let second = second?;
    assert_eq!(second.registration_id, 2);
    assert_eq!(second.script_url, url("https://example.com/app/v2.js"));

    let stored = context.get_all_registrations().await?;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].script, url("https://example.com/app/v2.js"));
    assert_eq!(harness.peer.start_count(), 2);
    Ok(())
}

#[tokio::test]
async fn test_register_after_unregister_gets_fresh_ids() -> Result<()> {
    let harness = TestHarness::start().await;
    let pattern = url("https://example.com/app/*");
    let script = url("https://example.com/app/sw.js");

    harness
        .context
        .register(pattern.clone(), script.clone(), None)
        .await?;
    harness.context.unregister(pattern.clone()).await?;

    let info = harness.context.register(pattern, script, None).await?;
    assert_eq!(info.registration_id, 2);
    assert_eq!(info.active_version_id(), Some(2));
    assert_eq!(
        harness.context.store().get_purgeable_resource_ids().await?,
        BTreeSet::from([1])
    );
    Ok(())
}

#[tokio::test]
async fn test_rejected_activation_removes_stored_registration() -> Result<()> {
    let behavior = PeerBehavior {
        activate_result: EventResult::Rejected,
        ..Default::default()
    };
    let harness =
        TestHarness::start_with(warden_storage::StorageLocation::InMemory, behavior).await;
    let pattern = url("https://example.com/app/*");

    let result = harness
        .context
        .register(pattern.clone(), url("https://example.com/app/sw.js"), None)
        .await;
    assert_eq!(result, Err(ServiceWorkerError::ActivateWorkerFailed));

    assert!(harness.context.get_all_registrations().await?.is_empty());
    assert_eq!(
        harness.context.find_registration(&pattern).await,
        Err(ServiceWorkerError::NotFound)
    );
    assert_eq!(
        harness.context.store().get_purgeable_resource_ids().await?,
        BTreeSet::from([1])
    );
    Ok(())
}

#[tokio::test]
async fn test_unregister_with_callback() -> Result<()> {
    let harness = TestHarness::start().await;
    let pattern = url("https://example.com/app/*");
    harness
        .context
        .register(pattern.clone(), url("https://example.com/app/sw.js"), None)
        .await?;

    let (done, result) = tokio::sync::oneshot::channel();
    harness
        .context
        .unregister_with_callback(pattern.clone(), move |result| {
            let _ = done.send(result);
        });
    assert_ok!(result.await?);
    assert_eq!(
        harness.context.find_registration(&pattern).await,
        Err(ServiceWorkerError::NotFound)
    );
    Ok(())
}

#[tokio::test]
async fn test_context_started_from_config() -> Result<()> {
    let config = WardenConfig::default();
    warden_logging::init_logging_from_config(&config.logging)?;

    let provider = FakeProcessProvider::new();
    let (host, receiver) = ChannelExecutionHost::new();
    let context =
        ServiceWorkerContext::start(&config, Box::new(provider.clone()), Arc::new(host)).await?;
    let peer = FakeExecutionPeer::spawn(receiver, context.host_event_sink(), PeerBehavior::default());

    let info = context
        .register(
            url("https://example.com/*"),
            url("https://example.com/sw.js"),
            None,
        )
        .await?;
    assert_eq!(info.active_version_id(), Some(1));
    assert_eq!(peer.start_count(), 1);
    assert_eq!(provider.created_processes().len(), 1);

    context.shutdown().await;
    assert_eq!(provider.live_references(), 0);
    Ok(())
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let mut config = WardenConfig::default();
    config.storage.file_name = String::new();

    let (host, _receiver) = ChannelExecutionHost::new();
    let result = ServiceWorkerContext::start(
        &config,
        Box::new(FakeProcessProvider::new()),
        Arc::new(host),
    )
    .await;
    assert!(matches!(result, Err(ServiceWorkerError::Failed(_))));
}
