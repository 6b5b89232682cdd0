//! Integration tests for client access management
//!
//! These tests tell the story of a cluster admin handing out client
//! certificates for a TLS server and taking them back.

use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::api::Api;

use certward::pki::Certificate;
use certward::rbac::{AccessGrant, RbacEntity, RbacError};
use certward::store::{IssueRequest, PkiStore, SecretRef};

use super::helpers::{ensure_test_cluster, fresh_namespace, test_options};

const NAMESPACE: &str = "certward-access-test";
const CA_NAME: &str = "server-ca";

/// Story: Admin grants a user and a service account, who then configure
/// their local credentials, and finally revokes them
///
/// Expected behavior:
/// - Each identity gets a credential secret, a Role and a RoleBinding
/// - configure writes a client certificate signed by the server CA
/// - revoke removes all three objects
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_admin_grants_configures_and_revokes() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    fresh_namespace(&client, NAMESPACE).await;

    let store = PkiStore::from_client(client.clone());
    let ca = store
        .store_ca(&IssueRequest::new(
            SecretRef::new(NAMESPACE, CA_NAME),
            "ca",
            test_options(CA_NAME),
        ))
        .await
        .expect("failed to store CA");

    let grant = AccessGrant::from_client(
        client.clone(),
        NAMESPACE,
        CA_NAME,
        test_options("client"),
    );
    let alice = RbacEntity::User("alice".to_string());
    let deployer = RbacEntity::service_account("ci/deployer").unwrap();

    // Act: grant both identities
    let report = grant
        .grant(&[alice.clone(), deployer.clone()])
        .await
        .expect("grant failed");
    assert!(report.is_success(), "{:?}", report);

    let roles: Api<Role> = Api::namespaced(client.clone(), NAMESPACE);
    let bindings: Api<RoleBinding> = Api::namespaced(client.clone(), NAMESPACE);
    for entity in [&alice, &deployer] {
        let name = AccessGrant::role_name(entity);
        assert!(roles.get_opt(&name).await.unwrap().is_some());
        let binding = bindings.get(&name).await.unwrap();
        let subjects = binding.subjects.unwrap_or_default();
        assert_eq!(subjects, vec![entity.subject()]);
    }

    // Act: the service account configures its credentials
    let dir = tempfile::tempdir().unwrap();
    let written = grant
        .configure(&deployer, dir.path())
        .await
        .expect("configure failed");
    assert_eq!(written.len(), 4);

    let cert = Certificate::from_pem(&std::fs::read(dir.path().join("client.crt")).unwrap())
        .unwrap();
    assert!(cert.verify_signed_by(&ca.certificate).unwrap());
    assert!(cert.subject().contains("system:serviceaccount:ci:deployer"));

    // Act: revoke both
    let report = grant
        .revoke(&[alice.clone(), deployer.clone()])
        .await
        .expect("revoke failed");
    assert!(report.is_success(), "{:?}", report);

    for entity in [&alice, &deployer] {
        let name = AccessGrant::role_name(entity);
        assert!(roles.get_opt(&name).await.unwrap().is_none());
        assert!(bindings.get_opt(&name).await.unwrap().is_none());
    }

    // Assert: configure after revoke reports missing credentials
    let err = grant
        .configure(&deployer, dir.path())
        .await
        .unwrap_err();
    assert!(matches!(err, RbacError::NoCredentials(_)));
}

/// Story: Granting against a server without a CA fails per identity
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_grant_without_ca_reports_each_identity() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    fresh_namespace(&client, NAMESPACE).await;

    let grant = AccessGrant::from_client(client, NAMESPACE, CA_NAME, test_options("client"));
    let report = grant
        .grant(&[
            RbacEntity::User("bob".to_string()),
            RbacEntity::Group("ops".to_string()),
        ])
        .await
        .expect("grant returns a report");

    assert!(!report.is_success());
    assert_eq!(report.failures().count(), 2);
}
