//! Test helpers for integration tests
//!
//! Provides utilities for managing the kind cluster and scratch namespaces.

use std::process::Command;
use std::sync::OnceLock;

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;

use certward::cluster::{connect, ConnectionOptions};
use certward::options::{DistinguishedName, TlsOptions};

/// Name of the kind cluster used for integration tests
pub const TEST_CLUSTER_NAME: &str = "certward-integration-test";

/// Global lock to ensure cluster is created only once
static CLUSTER_INIT: OnceLock<Result<(), String>> = OnceLock::new();

/// Check if a kind cluster with the given name exists
pub fn kind_cluster_exists(name: &str) -> bool {
    let output = Command::new("kind")
        .args(["get", "clusters"])
        .output()
        .expect("failed to run kind");

    let clusters = String::from_utf8_lossy(&output.stdout);
    clusters.lines().any(|line| line.trim() == name)
}

/// Create a kind cluster for testing
pub fn create_kind_cluster(name: &str) -> Result<(), String> {
    if kind_cluster_exists(name) {
        println!("Kind cluster '{name}' already exists, reusing it");
        return Ok(());
    }

    println!("Creating kind cluster '{name}'...");
    let output = Command::new("kind")
        .args(["create", "cluster", "--name", name, "--wait", "60s"])
        .output()
        .map_err(|e| format!("failed to run kind: {e}"))?;

    if !output.status.success() {
        return Err(format!(
            "failed to create kind cluster: {}",
            String::from_utf8_lossy(&output.stderr)
        ));
    }

    println!("Kind cluster '{name}' created successfully");
    Ok(())
}

/// Ensure the test cluster exists and return a fresh client for it
pub async fn ensure_test_cluster() -> Result<Client, String> {
    CLUSTER_INIT
        .get_or_init(|| create_kind_cluster(TEST_CLUSTER_NAME))
        .clone()?;

    let options = ConnectionOptions {
        context: Some(format!("kind-{TEST_CLUSTER_NAME}")),
        ..Default::default()
    };
    connect(&options)
        .await
        .map_err(|e| format!("failed to create client: {e}"))
}

/// Recreate a namespace so each story starts from an empty one
pub async fn fresh_namespace(client: &Client, name: &str) {
    let api: Api<Namespace> = Api::all(client.clone());
    let _ = api.delete(name, &DeleteParams::default()).await;

    // Deletion is asynchronous; wait for the namespace to disappear
    for _ in 0..60 {
        match api.get_opt(name).await {
            Ok(None) => break,
            _ => tokio::time::sleep(std::time::Duration::from_secs(1)).await,
        }
    }

    let namespace = Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    api.create(&PostParams::default(), &namespace)
        .await
        .expect("failed to create namespace");
}

/// Small ECDSA options for fast issuance
pub fn test_options(common_name: &str) -> TlsOptions {
    TlsOptions::new(DistinguishedName::new(common_name, "certward-tests"))
}
