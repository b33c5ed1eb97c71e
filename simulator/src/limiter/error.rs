use thiserror::Error;

/// Failure to create a single synthetic resource.
///
/// Carries the identifying metadata of the object that could not be created
/// so diagnostics do not need the object itself. `namespace` is empty for
/// cluster scoped resources.
#[derive(Debug, Error)]
#[error("failed to create {api_group}/{kind} {namespace}/{name}: {source}")]
pub struct CreateError {
    /// API group of the object that failed to be created.
    pub api_group: &'static str,
    /// Kind of the object that failed to be created.
    pub kind: &'static str,
    /// Namespace of the object that failed to be created.
    pub namespace: String,
    /// Name of the object that failed to be created.
    pub name: String,
    /// The underlying client error.
    #[source]
    pub source: kube::Error,
}

impl CreateError {
    /// Wrap a client error with the identity of the failed object.
    pub fn new(
        source: kube::Error,
        api_group: &'static str,
        kind: &'static str,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_group,
            kind,
            namespace: namespace.into(),
            name: name.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    #[test]
    fn message_names_the_target() {
        let err = CreateError::new(
            kube::Error::Api(ErrorResponse {
                status: "Failure".to_owned(),
                message: "boom".to_owned(),
                reason: "InternalError".to_owned(),
                code: 500,
            }),
            "v1",
            "Pod",
            "default",
            "test-pod",
        );
        let message = err.to_string();
        assert!(message.contains("v1/Pod"), "unexpected message: {message}");
        assert!(
            message.contains("default/test-pod"),
            "unexpected message: {message}"
        );
    }
}
