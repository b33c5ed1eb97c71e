use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use hyper::{body::to_bytes, Body};
use kube::Client;

pub type ApiServerHandle = tower_test::mock::Handle<http::Request<Body>, http::Response<Body>>;

// Create a kube client backed by a mock service, along with the handle used
// to script the API server side of the conversation.
pub fn mock_client() -> (Client, ApiServerHandle) {
    let (mock_service, handle) =
        tower_test::mock::pair::<http::Request<Body>, http::Response<Body>>();
    (Client::new(mock_service, "default"), handle)
}

pub async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
    tokio::time::timeout(std::time::Duration::from_secs(1), handle)
        .await
        .expect("timeout on mock apiserver")
        .expect("stub succeeded")
}

/// Counts requests per "METHOD path" while answering every create with a 201
/// echo of the submitted object, which is exactly what the typed client
/// expects back.
pub fn spawn_recording_apiserver(mut handle: ApiServerHandle) -> Arc<Mutex<HashMap<String, usize>>> {
    let requests = Arc::new(Mutex::new(HashMap::new()));
    let log = requests.clone();
    tokio::spawn(async move {
        while let Some((request, send)) = handle.next_request().await {
            let key = format!("{} {}", request.method(), request.uri().path());
            *log.lock().unwrap().entry(key).or_insert(0) += 1;
            let body = to_bytes(request.into_body())
                .await
                .expect("request body should be readable");
            send.send_response(
                http::Response::builder()
                    .status(201)
                    .body(Body::from(body))
                    .unwrap(),
            );
        }
    });
    requests
}

/// A canned API error body, as the real server would produce for a failed
/// create.
pub fn error_response(message: &str) -> http::Response<Body> {
    let status = serde_json::json!({
        "kind": "Status",
        "apiVersion": "v1",
        "status": "Failure",
        "message": message,
        "reason": "InternalError",
        "code": 500,
    });
    http::Response::builder()
        .status(500)
        .body(Body::from(status.to_string()))
        .unwrap()
}
