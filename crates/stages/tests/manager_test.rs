//! End-to-end tests of the network service manager chain.
//!
//! # Test Strategy
//!
//! 1. **Admission**: malformed requests, unknown closes, concurrent calls
//! 2. **Establishment**: forwarder programming, monitor events, signing
//! 3. **Failure handling**: forwarder retries, failure close, endpoint fallback
//! 4. **Heal**: fast path, destination re-request, disabled heal, service change
//! 5. **Multi-manager**: remote endpoint behind a peer manager

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use mesh::mechanism::{kernel, vxlan, workspace};
use mesh::{
    CallContext, ClientConnectionState, ConnectionId, ConnectionState, ErrorKind, ForwarderState,
    ManagerName, MeshConfig, MonitorEventKind, NetworkService, NetworkServiceRequest,
    ScopeSelector,
};
use stages::HealOutcome;
use tokio::sync::mpsc::error::TryRecvError;

fn id(value: &str) -> ConnectionId {
    ConnectionId::new(value).unwrap()
}

// ============================================================================
// Admission
// ============================================================================

#[tokio::test]
async fn test_request_without_preferences_is_rejected() {
    let endpoint = FakeEndpoint::new(1);
    let mesh = local_mesh(
        test_config("nsmgr"),
        FakeForwarder::new(),
        vec![(registration("nse-1", SERVICE, "nsmgr"), endpoint.clone())],
    );

    let mut request = client_request("C1", SERVICE);
    request.mechanism_preferences.clear();
    let err = mesh
        .manager
        .request(&CallContext::background(), request)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(mesh.manager.connections().is_empty(), "no record may be created");
    assert!(endpoint.requests().is_empty());
    assert_eq!(mesh.forwarder.requests(), 0);
}

#[tokio::test]
async fn test_close_of_unknown_connection_is_not_found() {
    let mesh = local_mesh(
        test_config("nsmgr"),
        FakeForwarder::new(),
        vec![(registration("nse-1", SERVICE, "nsmgr"), FakeEndpoint::new(1))],
    );
    let connection = client_request("ghost", SERVICE).connection;

    let err = mesh
        .manager
        .close(&CallContext::background(), &connection)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(mesh.manager.connections().is_empty());
    assert!(mesh.forwarder.closes().is_empty());
}

#[tokio::test]
async fn test_concurrent_request_for_same_id_is_a_state_conflict() {
    let gate = Gate::default();
    let endpoint = FakeEndpoint::gated(1, gate.clone());
    let mesh = local_mesh(
        test_config("nsmgr"),
        FakeForwarder::new(),
        vec![(registration("nse-1", SERVICE, "nsmgr"), endpoint)],
    );
    let ctx = CallContext::background();

    let first = mesh.manager.request(&ctx, client_request("C1", SERVICE));
    let second = async {
        gate.entered.notified().await;
        let conflict = mesh.manager.request(&ctx, client_request("C1", SERVICE)).await;
        let close = mesh
            .manager
            .close(&ctx, &client_request("C1", SERVICE).connection)
            .await;
        gate.release.notify_one();
        (conflict, close)
    };
    let (first, (conflict, close)) = tokio::join!(first, second);

    assert!(first.is_ok(), "first request should complete: {first:?}");
    assert_eq!(conflict.unwrap_err().kind(), ErrorKind::StateConflict);
    assert_eq!(close.unwrap_err().kind(), ErrorKind::StateConflict);
    assert_eq!(
        mesh.manager.connection(&id("C1")).unwrap().state,
        ClientConnectionState::Ready
    );
}

// ============================================================================
// Establishment
// ============================================================================

#[tokio::test]
async fn test_request_programs_forwarder_and_publishes_one_update() {
    let endpoint = FakeEndpoint::new(1);
    let mesh = local_mesh(
        test_config("nsmgr"),
        FakeForwarder::new(),
        vec![(registration("nse-1", SERVICE, "nsmgr"), endpoint.clone())],
    );
    let mut events = mesh.manager.subscribe(ScopeSelector::all()).unwrap();
    let initial = events.recv().await.unwrap();
    assert_eq!(initial.kind, MonitorEventKind::InitialStateTransfer);
    assert!(initial.connections.is_empty());

    let connection = mesh
        .manager
        .request(&CallContext::background(), client_request("C1", SERVICE))
        .await
        .unwrap();

    assert_eq!(connection.id, "C1");
    assert_eq!(connection.context.ip.src_ip_addr.as_deref(), Some("10.1.0.1/32"));
    assert_eq!(connection.context.ip.dst_ip_addr.as_deref(), Some("10.1.0.2/32"));
    assert_eq!(
        connection.mechanism.as_ref().map(|m| m.mechanism_type.as_str()),
        Some(kernel::MECHANISM)
    );
    assert_eq!(connection.path.manager_names().collect::<Vec<_>>(), vec!["nsmgr"]);
    assert_eq!(mesh.forwarder.requests(), 1);

    let record = mesh.manager.connection(&id("C1")).unwrap();
    assert_eq!(record.state, ClientConnectionState::Ready);
    assert_eq!(record.forwarder_state, ForwarderState::Ready);
    assert_eq!(record.endpoint.as_ref().unwrap().name.as_str(), "nse-1");
    assert!(record.remote_manager.is_none());

    // Workspace parameters stay on the destination leg only.
    let destination = record.destination().unwrap();
    let mechanism = destination.mechanism.as_ref().unwrap();
    assert_eq!(mechanism.parameter(workspace::WORKSPACE), Some("ws-1"));
    assert_eq!(mechanism.parameter(workspace::WORKSPACE_NSE_NAME), Some("nse-1"));
    for leg in [&connection, record.source().unwrap()] {
        let mechanism = leg.mechanism.as_ref().unwrap();
        for key in workspace::PRIVATE_PARAMETERS {
            assert!(mechanism.parameter(key).is_none(), "{key} leaked to the client leg");
        }
    }

    let update = events.recv().await.unwrap();
    assert_eq!(update.kind, MonitorEventKind::Update);
    assert_eq!(update.connections.len(), 1);
    assert_eq!(update.connections[0].id, "C1");
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn test_close_releases_forwarder_endpoint_and_record() {
    let endpoint = FakeEndpoint::new(1);
    let mesh = local_mesh(
        test_config("nsmgr"),
        FakeForwarder::new(),
        vec![(registration("nse-1", SERVICE, "nsmgr"), endpoint.clone())],
    );
    let ctx = CallContext::background();
    let connection = mesh
        .manager
        .request(&ctx, client_request("C1", SERVICE))
        .await
        .unwrap();
    let destination_id = mesh
        .manager
        .connection(&id("C1"))
        .unwrap()
        .destination()
        .unwrap()
        .id
        .clone();
    let mut events = mesh.manager.subscribe(ScopeSelector::all()).unwrap();
    let _ = events.recv().await;

    mesh.manager.close(&ctx, &connection).await.unwrap();

    assert!(mesh.manager.connections().is_empty());
    assert_eq!(endpoint.closes(), vec![destination_id]);
    assert_eq!(mesh.forwarder.closes(), vec!["C1".to_string()]);
    let deleted = events.recv().await.unwrap();
    assert_eq!(deleted.kind, MonitorEventKind::Delete);
}

#[tokio::test]
async fn test_connection_is_signed_and_forged_signature_rejected() {
    let mesh = mesh_with(
        test_config("nsmgr"),
        FakeForwarder::new(),
        vec![(registration("nse-1", SERVICE, "nsmgr"), FakeEndpoint::new(1))],
        Vec::new(),
        |builder| builder.signer(Arc::new(FakeSigner)),
    );
    let ctx = CallContext::background();

    let connection = mesh
        .manager
        .request(&ctx, client_request("C1", SERVICE))
        .await
        .unwrap();
    assert_eq!(connection.signature.as_deref(), Some("signed:C1"));
    assert_eq!(connection.path.current().unwrap().token, "signed:C1");

    let mut forged = client_request("C2", SERVICE);
    forged.connection.signature = Some("forged".to_string());
    let err = mesh.manager.request(&ctx, forged).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(mesh.manager.connection(&id("C2")).is_none());
}

#[tokio::test]
async fn test_signing_failure_releases_forwarder_and_endpoint() {
    let endpoint = FakeEndpoint::new(1);
    let mesh = mesh_with(
        test_config("nsmgr"),
        FakeForwarder::new(),
        vec![(registration("nse-1", SERVICE, "nsmgr"), endpoint.clone())],
        Vec::new(),
        |builder| builder.signer(Arc::new(RejectingSigner)),
    );

    let err = mesh
        .manager
        .request(&CallContext::background(), client_request("C1", SERVICE))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Transport);
    assert!(mesh.manager.connections().is_empty());
    // The cross connect was programmed before signing failed; it must not outlive the record.
    assert_eq!(mesh.forwarder.requests(), 1);
    assert_eq!(mesh.forwarder.closes(), vec!["C1".to_string()]);
    let requests = endpoint.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(endpoint.closes(), vec![requests[0].connection.id.clone()]);
}

#[tokio::test]
async fn test_close_without_monitor_reports_configuration_error() {
    let mesh = mesh_with(
        test_config("nsmgr"),
        FakeForwarder::new(),
        vec![(registration("nse-1", SERVICE, "nsmgr"), FakeEndpoint::new(1))],
        Vec::new(),
        |builder| builder.monitor(None),
    );
    let ctx = CallContext::background();
    assert_eq!(
        mesh.manager.subscribe(ScopeSelector::all()).unwrap_err().kind(),
        ErrorKind::Configuration
    );

    let connection = mesh
        .manager
        .request(&ctx, client_request("C1", SERVICE))
        .await
        .unwrap();
    let err = mesh.manager.close(&ctx, &connection).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(mesh.manager.connections().is_empty(), "record is removed regardless");
}

// ============================================================================
// Failure handling
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_forwarder_exhaustion_cleans_up_and_returns_transport_error() {
    let endpoint = FakeEndpoint::new(1);
    let mesh = local_mesh(
        test_config("nsmgr"),
        FakeForwarder::always_failing(),
        vec![(registration("nse-1", SERVICE, "nsmgr"), endpoint.clone())],
    );

    let err = mesh
        .manager
        .request(&CallContext::background(), client_request("C1", SERVICE))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Transport);
    assert_eq!(mesh.forwarder.requests(), 10);
    assert!(mesh.manager.connections().is_empty(), "no record may remain");
    // Failure close reaches both the forwarder and the endpoint.
    assert_eq!(mesh.forwarder.closes(), vec!["C1".to_string()]);
    assert_eq!(endpoint.closes().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_caller_deadline_stops_forwarder_retries() {
    let endpoint = FakeEndpoint::new(1);
    let config = MeshConfig {
        forwarder_retry_delay: Duration::from_millis(100),
        ..test_config("nsmgr")
    };
    let mesh = local_mesh(
        config,
        FakeForwarder::always_failing(),
        vec![(registration("nse-1", SERVICE, "nsmgr"), endpoint.clone())],
    );
    let ctx = CallContext::with_timeout(Duration::from_millis(250));

    let err = mesh
        .manager
        .request(&ctx, client_request("C1", SERVICE))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(ctx.is_expired());
    assert_eq!(mesh.forwarder.requests(), 3, "attempts at 0, 100 and 200 ms only");
    // Cleanup runs on its own deadline, after the caller's has passed.
    assert_eq!(mesh.forwarder.closes(), vec!["C1".to_string()]);
    let requests = endpoint.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(endpoint.closes(), vec![requests[0].connection.id.clone()]);
    assert!(mesh.manager.connections().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_forwarder_recovers_after_transient_failures() {
    let mesh = local_mesh(
        test_config("nsmgr"),
        FakeForwarder::failing_first(3),
        vec![(registration("nse-1", SERVICE, "nsmgr"), FakeEndpoint::new(1))],
    );

    let connection = mesh
        .manager
        .request(&CallContext::background(), client_request("C1", SERVICE))
        .await
        .unwrap();

    assert_eq!(connection.id, "C1");
    assert_eq!(mesh.forwarder.requests(), 4);
    assert!(mesh.forwarder.closes().is_empty());
}

#[tokio::test]
async fn test_failed_endpoint_is_excluded_and_next_candidate_used() {
    let broken = FakeEndpoint::failing(1);
    let healthy = FakeEndpoint::new(2);
    let mesh = local_mesh(
        test_config("nsmgr"),
        FakeForwarder::new(),
        vec![
            (registration("nse-1", SERVICE, "nsmgr"), broken.clone()),
            (registration("nse-2", SERVICE, "nsmgr"), healthy.clone()),
        ],
    );

    let connection = mesh
        .manager
        .request(&CallContext::background(), client_request("C1", SERVICE))
        .await
        .unwrap();

    assert_eq!(connection.context.ip.dst_ip_addr.as_deref(), Some("10.2.0.2/32"));
    assert_eq!(
        mesh.endpoints.lookups(),
        vec![Vec::<String>::new(), vec!["nse-1".to_string()]]
    );
    assert_eq!(broken.requests().len(), 1);
    assert_eq!(healthy.requests().len(), 1);
    let record = mesh.manager.connection(&id("C1")).unwrap();
    assert_eq!(record.endpoint.as_ref().unwrap().name.as_str(), "nse-2");
}

#[tokio::test]
async fn test_all_endpoints_failing_reports_selection_with_last_error() {
    let mesh = local_mesh(
        test_config("nsmgr"),
        FakeForwarder::new(),
        vec![
            (registration("nse-1", SERVICE, "nsmgr"), FakeEndpoint::failing(1)),
            (registration("nse-2", SERVICE, "nsmgr"), FakeEndpoint::failing(2)),
        ],
    );

    let err = mesh
        .manager
        .request(&CallContext::background(), client_request("C1", SERVICE))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Selection);
    assert!(err.to_string().contains("10.2.0.0 unavailable"), "{err}");
    assert_eq!(mesh.endpoints.lookups().len(), 3);
    assert!(mesh.manager.connections().is_empty());
}

// ============================================================================
// Heal
// ============================================================================

#[tokio::test]
async fn test_unchanged_re_request_heals_without_endpoint_call() {
    let endpoint = FakeEndpoint::new(1);
    let mesh = local_mesh(
        test_config("nsmgr"),
        FakeForwarder::new(),
        vec![(registration("nse-1", SERVICE, "nsmgr"), endpoint.clone())],
    );
    let ctx = CallContext::background();
    let established = mesh
        .manager
        .request(&ctx, client_request("C1", SERVICE))
        .await
        .unwrap();

    let request = NetworkServiceRequest::new(established, vec![kernel_preference()]);
    let healed = mesh.manager.request(&ctx, request).await.unwrap();

    assert_eq!(endpoint.requests().len(), 1, "no endpoint request on the fast path");
    let record = mesh.manager.connection(&id("C1")).unwrap();
    assert_eq!(record.state, ClientConnectionState::Ready);
    assert_eq!(healed.context, record.destination().unwrap().context);
}

#[tokio::test]
async fn test_rejected_destination_context_on_heal_closes_destination() {
    let endpoint = FakeEndpoint::new(1);
    let mesh = local_mesh(
        test_config("nsmgr"),
        FakeForwarder::rewriting(|cross_connect| {
            cross_connect.destination.context.ip.src_ip_addr = Some("not-an-address".to_string());
        }),
        vec![(registration("nse-1", SERVICE, "nsmgr"), endpoint.clone())],
    );
    let ctx = CallContext::background();
    let established = mesh
        .manager
        .request(&ctx, client_request("C1", SERVICE))
        .await
        .unwrap();
    let destination_id = mesh
        .manager
        .connection(&id("C1"))
        .unwrap()
        .destination()
        .unwrap()
        .id
        .clone();

    let request = NetworkServiceRequest::new(established, vec![kernel_preference()]);
    let err = mesh.manager.request(&ctx, request).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Invariant);
    assert_eq!(endpoint.requests().len(), 1, "the fast path never re-requests");
    assert_eq!(endpoint.closes(), vec![destination_id]);
    let record = mesh.manager.connection(&id("C1")).unwrap();
    assert_eq!(record.state, ClientConnectionState::Broken);
}

#[tokio::test]
async fn test_re_request_with_heal_disabled_always_reselects() {
    let endpoint = FakeEndpoint::new(1);
    let config = MeshConfig {
        heal_enabled: false,
        ..test_config("nsmgr")
    };
    let mesh = local_mesh(
        config,
        FakeForwarder::new(),
        vec![(registration("nse-1", SERVICE, "nsmgr"), endpoint.clone())],
    );
    let ctx = CallContext::background();
    let established = mesh
        .manager
        .request(&ctx, client_request("C1", SERVICE))
        .await
        .unwrap();

    let request = NetworkServiceRequest::new(established, vec![kernel_preference()]);
    mesh.manager.request(&ctx, request).await.unwrap();

    assert_eq!(endpoint.requests().len(), 2);
}

#[tokio::test]
async fn test_heal_re_requests_destination_with_same_identity() {
    let endpoint = FakeEndpoint::new(1);
    let mesh = local_mesh(
        test_config("nsmgr"),
        FakeForwarder::new(),
        vec![(registration("nse-1", SERVICE, "nsmgr"), endpoint.clone())],
    );
    mesh.manager
        .request(&CallContext::background(), client_request("C1", SERVICE))
        .await
        .unwrap();

    let outcome = mesh.manager.heal(&id("C1")).await.unwrap();

    assert!(matches!(outcome, HealOutcome::Healed(ref c) if c.id == "C1"));
    let requests = endpoint.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].connection.id, requests[1].connection.id);
    let record = mesh.manager.connection(&id("C1")).unwrap();
    assert_eq!(record.state, ClientConnectionState::Ready);
    assert_eq!(record.destination().unwrap().state, ConnectionState::Up);
}

#[tokio::test(start_paused = true)]
async fn test_heal_that_gives_up_leaves_record_broken() {
    let endpoint = FakeEndpoint::new(1);
    let config = MeshConfig {
        heal_retry_count: 2,
        ..test_config("nsmgr")
    };
    let mesh = local_mesh(
        config,
        FakeForwarder::new(),
        vec![(registration("nse-1", SERVICE, "nsmgr"), endpoint.clone())],
    );
    mesh.manager
        .request(&CallContext::background(), client_request("C1", SERVICE))
        .await
        .unwrap();
    endpoint.set_failing(true);

    let err = mesh.manager.heal(&id("C1")).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Selection);
    assert_eq!(endpoint.requests().len(), 3);
    let record = mesh.manager.connection(&id("C1")).unwrap();
    assert_eq!(record.state, ClientConnectionState::Broken);

    // A later re-request recovers a broken record.
    endpoint.set_failing(false);
    let outcome = mesh.manager.heal(&id("C1")).await.unwrap();
    assert!(matches!(outcome, HealOutcome::Healed(_)));
}

#[tokio::test]
async fn test_heal_disabled_closes_connection() {
    let endpoint = FakeEndpoint::new(1);
    let config = MeshConfig {
        heal_enabled: false,
        ..test_config("nsmgr")
    };
    let mesh = local_mesh(
        config,
        FakeForwarder::new(),
        vec![(registration("nse-1", SERVICE, "nsmgr"), endpoint.clone())],
    );
    mesh.manager
        .request(&CallContext::background(), client_request("C1", SERVICE))
        .await
        .unwrap();

    let outcome = mesh.manager.heal(&id("C1")).await.unwrap();

    assert_eq!(outcome, HealOutcome::Closed);
    assert!(mesh.manager.connections().is_empty());
    assert_eq!(endpoint.closes().len(), 1);
}

#[tokio::test]
async fn test_heal_of_unknown_connection_is_not_found() {
    let mesh = local_mesh(
        test_config("nsmgr"),
        FakeForwarder::new(),
        vec![(registration("nse-1", SERVICE, "nsmgr"), FakeEndpoint::new(1))],
    );
    let err = mesh.manager.heal(&id("missing")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_network_service_change_closes_previous_destination() {
    let first = FakeEndpoint::new(1);
    let second = FakeEndpoint::new(2);
    let mesh = local_mesh(
        test_config("nsmgr"),
        FakeForwarder::new(),
        vec![
            (registration("nse-a", "service-a", "nsmgr"), first.clone()),
            (registration("nse-b", "service-b", "nsmgr"), second.clone()),
        ],
    );
    let ctx = CallContext::background();
    let established = mesh
        .manager
        .request(&ctx, client_request("C1", "service-a"))
        .await
        .unwrap();

    let mut moved = established;
    moved.network_service = "service-b".to_string();
    let connection = mesh
        .manager
        .request(&ctx, NetworkServiceRequest::new(moved, vec![kernel_preference()]))
        .await
        .unwrap();

    assert_eq!(connection.network_service, "service-b");
    assert_eq!(first.closes().len(), 1);
    assert_eq!(second.requests().len(), 1);
    let record = mesh.manager.connection(&id("C1")).unwrap();
    assert_eq!(record.endpoint.as_ref().unwrap().name.as_str(), "nse-b");
    assert_ne!(
        record.destination().unwrap().id,
        first.requests()[0].connection.id,
        "the new destination gets a fresh id"
    );
}

// ============================================================================
// Multi-manager
// ============================================================================

#[tokio::test]
async fn test_remote_endpoint_is_reached_through_peer_manager() {
    let endpoint = FakeEndpoint::new(7);
    let remote = Arc::new(
        local_mesh(
            test_config("nsmgr-b"),
            FakeForwarder::new(),
            vec![(registration("nse-remote", SERVICE, "nsmgr-b"), endpoint.clone())],
        )
        .manager,
    );
    let local = mesh_with(
        test_config("nsmgr-a"),
        FakeForwarder::new(),
        Vec::new(),
        vec![(
            ManagerName::new("nsmgr-b").unwrap(),
            remote.clone() as Arc<dyn NetworkService>,
        )],
        |builder| builder,
    );
    local
        .endpoints
        .inner
        .register(registration("nse-remote", SERVICE, "nsmgr-b"));
    let ctx = CallContext::background();

    let connection = local
        .manager
        .request(&ctx, client_request("C1", SERVICE))
        .await
        .unwrap();

    assert_eq!(connection.context.ip.dst_ip_addr.as_deref(), Some("10.7.0.2/32"));
    let record = local.manager.connection(&id("C1")).unwrap();
    assert_eq!(record.remote_manager.as_ref().map(|m| m.as_str()), Some("nsmgr-b"));
    let destination = record.destination().unwrap();
    assert!(destination.is_remote());
    let mechanism = destination.mechanism.as_ref().unwrap();
    assert_eq!(mechanism.mechanism_type, vxlan::MECHANISM);
    assert!(mechanism.parameter(vxlan::VNI).is_some());
    assert_eq!(
        destination.path.manager_names().collect::<Vec<_>>(),
        vec!["nsmgr-a", "nsmgr-b"]
    );

    // The peer assigned its own id and holds its own record.
    assert_ne!(destination.id, "-");
    let peer_id = ConnectionId::new(destination.id.as_str()).unwrap();
    assert_eq!(
        remote.connection(&peer_id).unwrap().state,
        ClientConnectionState::Ready
    );

    local.manager.close(&ctx, &connection).await.unwrap();
    assert!(local.manager.connections().is_empty());
    assert!(remote.connections().is_empty());
    assert_eq!(endpoint.closes().len(), 1);
}

#[tokio::test]
async fn test_builder_requires_collaborators() {
    let err = stages::NetworkServiceManager::builder(test_config("nsmgr"))
        .build()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}
