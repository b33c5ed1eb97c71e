//! RBAC provisioning for in-cluster simulation jobs.
//!
//! The remote simulator pod needs to fabricate nodes, pods and jobs itself,
//! so its service account gets a cluster role covering exactly those verbs.
//! Objects are server-side applied so repeated runs converge instead of
//! failing on conflict.

use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::core::ObjectMeta;
use kube::Client;
use tracing::info;

/// Service account the simulator job runs as.
pub const SERVICE_ACCOUNT_NAME: &str = "stampede-simulator";

const CLUSTER_ROLE_NAME: &str = "stampede-simulator-role";
const CLUSTER_ROLE_BINDING_NAME: &str = "stampede-simulator-binding";
const FIELD_MANAGER: &str = "stampede";

/// Apply the service account, cluster role and binding the remote simulator
/// job needs.
pub async fn apply_rbac(client: Client, namespace: &str) -> Result<(), kube::Error> {
    info!(namespace, "applying simulator rbac");
    apply_service_account(client.clone(), namespace).await?;
    apply_cluster_role(client.clone()).await?;
    apply_cluster_role_binding(client, namespace).await?;
    Ok(())
}

/// Delete the RBAC objects created by [`apply_rbac`], tolerating absence.
pub async fn delete_rbac(client: Client, namespace: &str) -> Result<(), kube::Error> {
    info!(namespace, "deleting simulator rbac");
    let bindings: Api<ClusterRoleBinding> = Api::all(client.clone());
    delete_ignoring_absence(bindings, CLUSTER_ROLE_BINDING_NAME).await?;
    let roles: Api<ClusterRole> = Api::all(client.clone());
    delete_ignoring_absence(roles, CLUSTER_ROLE_NAME).await?;
    let accounts: Api<ServiceAccount> = Api::namespaced(client, namespace);
    delete_ignoring_absence(accounts, SERVICE_ACCOUNT_NAME).await?;
    Ok(())
}

async fn apply_service_account(client: Client, namespace: &str) -> Result<(), kube::Error> {
    let serverside = PatchParams::apply(FIELD_MANAGER);
    let accounts: Api<ServiceAccount> = Api::namespaced(client, namespace);
    let account = ServiceAccount {
        metadata: ObjectMeta {
            name: Some(SERVICE_ACCOUNT_NAME.to_owned()),
            ..Default::default()
        },
        ..Default::default()
    };
    accounts
        .patch(SERVICE_ACCOUNT_NAME, &serverside, &Patch::Apply(account))
        .await?;
    Ok(())
}

async fn apply_cluster_role(client: Client) -> Result<(), kube::Error> {
    let serverside = PatchParams::apply(FIELD_MANAGER);
    let roles: Api<ClusterRole> = Api::all(client);
    let role = ClusterRole {
        metadata: ObjectMeta {
            name: Some(CLUSTER_ROLE_NAME.to_owned()),
            ..Default::default()
        },
        rules: Some(vec![
            PolicyRule {
                api_groups: Some(vec![String::new()]),
                resources: Some(vec!["nodes".to_owned()]),
                verbs: creation_verbs(),
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(vec![String::new()]),
                resources: Some(vec!["pods".to_owned(), "pods/log".to_owned()]),
                verbs: creation_verbs(),
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(vec!["batch".to_owned()]),
                resources: Some(vec!["jobs".to_owned()]),
                verbs: creation_verbs(),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };
    roles
        .patch(CLUSTER_ROLE_NAME, &serverside, &Patch::Apply(role))
        .await?;
    Ok(())
}

async fn apply_cluster_role_binding(client: Client, namespace: &str) -> Result<(), kube::Error> {
    let serverside = PatchParams::apply(FIELD_MANAGER);
    let bindings: Api<ClusterRoleBinding> = Api::all(client);
    let binding = ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(CLUSTER_ROLE_BINDING_NAME.to_owned()),
            ..Default::default()
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_owned(),
            name: SERVICE_ACCOUNT_NAME.to_owned(),
            namespace: Some(namespace.to_owned()),
            ..Default::default()
        }]),
        role_ref: RoleRef {
            kind: "ClusterRole".to_owned(),
            name: CLUSTER_ROLE_NAME.to_owned(),
            api_group: "rbac.authorization.k8s.io".to_owned(),
        },
    };
    bindings
        .patch(CLUSTER_ROLE_BINDING_NAME, &serverside, &Patch::Apply(binding))
        .await?;
    Ok(())
}

fn creation_verbs() -> Vec<String> {
    ["create", "delete", "deletecollection", "get", "list", "watch"]
        .map(str::to_owned)
        .to_vec()
}

async fn delete_ignoring_absence<K>(api: Api<K>, name: &str) -> Result<(), kube::Error>
where
    K: Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(err)) if err.reason == "NotFound" => Ok(()),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use http::{Method, Response};
    use hyper::{body::to_bytes, Body};

    use crate::utils::test::{mock_client, timeout_after_1s};

    #[tokio::test]
    async fn rbac_objects_are_server_side_applied() {
        let (client, mut handle) = mock_client();
        let server = tokio::spawn(async move {
            let expected_paths = [
                "/api/v1/namespaces/stress/serviceaccounts/stampede-simulator",
                "/apis/rbac.authorization.k8s.io/v1/clusterroles/stampede-simulator-role",
                "/apis/rbac.authorization.k8s.io/v1/clusterrolebindings/stampede-simulator-binding",
            ];
            for expected in expected_paths {
                let (request, send) = handle.next_request().await.expect("service not called");
                assert_eq!(request.method(), Method::PATCH);
                assert_eq!(request.uri().path(), expected);
                assert!(request
                    .uri()
                    .query()
                    .unwrap_or_default()
                    .contains("fieldManager=stampede"));
                let body = to_bytes(request.into_body()).await.unwrap();
                send.send_response(
                    Response::builder()
                        .status(200)
                        .body(Body::from(body))
                        .unwrap(),
                );
            }
        });

        apply_rbac(client, "stress").await.expect("apply succeeds");
        timeout_after_1s(server).await;
    }

    fn success_status() -> Response<Body> {
        let status = serde_json::json!({
            "kind": "Status",
            "apiVersion": "v1",
            "status": "Success",
            "code": 200,
        });
        Response::builder()
            .status(200)
            .body(Body::from(status.to_string()))
            .unwrap()
    }

    fn not_found() -> Response<Body> {
        let status = serde_json::json!({
            "kind": "Status",
            "apiVersion": "v1",
            "status": "Failure",
            "message": "not found",
            "reason": "NotFound",
            "code": 404,
        });
        Response::builder()
            .status(404)
            .body(Body::from(status.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn rbac_teardown_tolerates_missing_objects() {
        let (client, mut handle) = mock_client();
        let server = tokio::spawn(async move {
            let expected_paths = [
                "/apis/rbac.authorization.k8s.io/v1/clusterrolebindings/stampede-simulator-binding",
                "/apis/rbac.authorization.k8s.io/v1/clusterroles/stampede-simulator-role",
                "/api/v1/namespaces/stress/serviceaccounts/stampede-simulator",
            ];
            for (i, expected) in expected_paths.iter().enumerate() {
                let (request, send) = handle.next_request().await.expect("service not called");
                assert_eq!(request.method(), Method::DELETE);
                assert_eq!(request.uri().path(), *expected);
                // The cluster role is already gone; teardown carries on.
                if i == 1 {
                    send.send_response(not_found());
                } else {
                    send.send_response(success_status());
                }
            }
        });

        delete_rbac(client, "stress").await.expect("delete succeeds");
        timeout_after_1s(server).await;
    }
}
