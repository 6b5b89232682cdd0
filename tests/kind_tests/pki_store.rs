//! Integration tests for secret-backed PKI storage
//!
//! These tests tell the story of an operator bootstrapping a CA for a
//! privileged server and issuing the server's own certificate from it.

use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;

use certward::pki::Certificate;
use certward::store::provenance::{MANAGED_BY_LABEL, PROVENANCE_ANNOTATION};
use certward::store::{IssueRequest, PkiStore, SecretRef, StoreError};

use super::helpers::{ensure_test_cluster, fresh_namespace, test_options};

const NAMESPACE: &str = "certward-store-test";

/// Story: Operator creates a CA and then the server certificate it signs
///
/// Expected behavior:
/// - The CA secret holds ca.crt/.pem/.pub and provenance annotations
/// - The server secret names the CA it was signed by
/// - The server certificate verifies against the stored CA
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_operator_bootstraps_ca_and_server_certificate() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    fresh_namespace(&client, NAMESPACE).await;
    let store = PkiStore::from_client(client.clone());

    // Act: generate the CA
    let ca_ref = SecretRef::new(NAMESPACE, "tiller-ca");
    let ca = store
        .store_ca(&IssueRequest::new(ca_ref.clone(), "ca", test_options("tiller-ca")))
        .await
        .expect("failed to store CA");
    assert!(ca.certificate.is_ca().unwrap());

    // Assert: the secret carries its data keys and provenance
    let secrets: Api<Secret> = Api::namespaced(client.clone(), NAMESPACE);
    let stored = secrets.get("tiller-ca").await.expect("CA secret missing");
    let data = stored.data.expect("CA secret has no data");
    for key in ["ca.crt", "ca.pem", "ca.pub"] {
        assert!(data.contains_key(key), "missing {key}");
    }
    let annotations = stored.metadata.annotations.unwrap_or_default();
    assert!(annotations.contains_key(PROVENANCE_ANNOTATION));
    let labels = stored.metadata.labels.unwrap_or_default();
    assert_eq!(labels.get(MANAGED_BY_LABEL).map(String::as_str), Some("certward"));

    // Act: issue the server certificate from the stored CA
    let mut request = IssueRequest::new(
        SecretRef::new(NAMESPACE, "tiller-secret"),
        "tiller",
        test_options("tiller-server"),
    );
    request.dns_names = vec!["tiller-deploy.certward-store-test.svc".to_string()];
    let server = store
        .store_signed(&request, &ca_ref, "")
        .await
        .expect("failed to store server certificate");

    // Assert: provenance links back to the CA and the chain verifies
    let (provenance, certificate) = store
        .inspect(&server.secret)
        .await
        .expect("failed to inspect");
    assert_eq!(provenance.signed_by.as_ref(), Some(&ca_ref));
    assert_eq!(provenance.filename_base, "tiller");
    assert!(certificate.verify_signed_by(&ca.certificate).unwrap());

    let bundle = store.load_bundle(&server.secret).await.unwrap();
    let ca_pem = bundle.ca_certificate.expect("signed record lacks ca.crt");
    assert_eq!(
        Certificate::from_pem(&ca_pem).unwrap().subject(),
        ca.certificate.subject()
    );
}

/// Story: Issuing from a CA that was never created fails without writing
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_missing_ca_leaves_nothing_behind() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    fresh_namespace(&client, NAMESPACE).await;
    let store = PkiStore::from_client(client.clone());

    let target = SecretRef::new(NAMESPACE, "orphan");
    let err = store
        .store_signed(
            &IssueRequest::new(target.clone(), "orphan", test_options("orphan")),
            &SecretRef::new(NAMESPACE, "no-such-ca"),
            "",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::CaNotFound { .. }));

    let secrets: Api<Secret> = Api::namespaced(client, NAMESPACE);
    assert!(secrets.get_opt("orphan").await.unwrap().is_none());
}

/// Story: A second CA with the same name is refused, not overwritten
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_existing_record_is_never_overwritten() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    fresh_namespace(&client, NAMESPACE).await;
    let store = PkiStore::from_client(client);

    let request = IssueRequest::new(SecretRef::new(NAMESPACE, "dup-ca"), "ca", test_options("dup"));
    let first = store.store_ca(&request).await.expect("first CA");

    let err = store.store_ca(&request).await.unwrap_err();
    assert!(matches!(err, StoreError::AlreadyExists { .. }));

    let (_, certificate) = store.inspect(&first.secret).await.unwrap();
    assert_eq!(
        certificate.info().unwrap().serial,
        first.certificate.info().unwrap().serial
    );
}
