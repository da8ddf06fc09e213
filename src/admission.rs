use crate::metrics::{FailureReason, MetricsSink};
use crate::policy::{Classification, RewritePolicy};
use crate::rewrite::{ContainerSet, PodRewrite, rewrite_pod};
use anyhow::{Context, anyhow};
use k8s_openapi::api::core::v1::Pod;
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{error, info};

const POD_RESOURCE: &str = "pods";

/// Why a request was refused. Each reason maps to a failure counter label.
#[derive(Debug)]
struct Rejection {
    reason: FailureReason,
    message: String,
}

impl Rejection {
    fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

/// Mutating admission webhook that points pod images at the configured mirrors.
pub struct Webhook {
    policy: Arc<RewritePolicy>,
    pull_secret: Option<String>,
    metrics: Arc<dyn MetricsSink>,
}

impl Webhook {
    pub fn new(
        policy: Arc<RewritePolicy>,
        pull_secret: Option<String>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        info!(
            pull_secret_configured = pull_secret.is_some(),
            pull_secret_name = pull_secret.as_deref().unwrap_or_default(),
            "Pull secret startup configuration"
        );
        Self {
            policy,
            pull_secret,
            metrics,
        }
    }

    /// Answers a raw `AdmissionReview` body. Always yields a review, even
    /// when the body cannot be decoded.
    pub fn handle(&self, body: &[u8]) -> AdmissionReview<DynamicObject> {
        let review: AdmissionReview<DynamicObject> = match serde_json::from_slice(body) {
            Ok(review) => review,
            Err(err) => return self.invalid(format!("failed to decode admission review: {err}")),
        };
        let request: AdmissionRequest<DynamicObject> = match review.try_into() {
            Ok(request) => request,
            Err(err) => return self.invalid(format!("invalid admission review: {err}")),
        };
        self.mutate(&request).into_review()
    }

    fn invalid(&self, message: String) -> AdmissionReview<DynamicObject> {
        self.metrics.webhook_failure(FailureReason::DecodeError, "");
        error!("{}", message);
        AdmissionResponse::invalid(message).into_review()
    }

    pub fn mutate(&self, request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
        let namespace = request.namespace.as_deref().unwrap_or_default();
        info!(
            namespace,
            name = %request.name,
            uid = %request.uid,
            "mutating pod"
        );

        match self.review_pod(request, namespace) {
            Ok(None) => {
                info!(namespace, name = %request.name, "No pod images were rewritten");
                self.metrics.webhook_result(false, namespace);
                AdmissionResponse::from(request)
            }
            Ok(Some(patch)) => match AdmissionResponse::from(request).with_patch(patch) {
                Ok(response) => {
                    info!(namespace, name = %request.name, "Pod images were rewritten");
                    self.metrics.webhook_result(true, namespace);
                    response
                }
                Err(err) => self.reject(
                    request,
                    namespace,
                    Rejection::new(
                        FailureReason::MarshalingFailed,
                        format!("failed to serialize patch: {err}"),
                    ),
                ),
            },
            Err(rejection) => self.reject(request, namespace, rejection),
        }
    }

    fn reject(
        &self,
        request: &AdmissionRequest<DynamicObject>,
        namespace: &str,
        rejection: Rejection,
    ) -> AdmissionResponse {
        self.metrics.webhook_failure(rejection.reason, namespace);
        error!(
            namespace,
            name = %request.name,
            reason = rejection.reason.as_str(),
            "{}",
            rejection.message
        );
        AdmissionResponse::from(request).deny(rejection.message)
    }

    /// Returns the JSON patch for the pod, or `None` when no image changed.
    fn review_pod(
        &self,
        request: &AdmissionRequest<DynamicObject>,
        namespace: &str,
    ) -> Result<Option<json_patch::Patch>, Rejection> {
        if request.resource.resource != POD_RESOURCE {
            return Err(Rejection::new(
                FailureReason::InvalidResourceType,
                "expect resource to be pods",
            ));
        }

        let object = request.object.as_ref().ok_or_else(|| {
            Rejection::new(
                FailureReason::DecodeError,
                "admission request does not contain an object",
            )
        })?;
        let original = serde_json::to_value(object).map_err(|err| {
            Rejection::new(FailureReason::DecodeError, format!("failed to decode pod: {err}"))
        })?;
        let pod: Pod = serde_json::from_value(original.clone()).map_err(|err| {
            Rejection::new(FailureReason::DecodeError, format!("failed to decode pod: {err}"))
        })?;
        let spec = pod
            .spec
            .as_ref()
            .ok_or_else(|| Rejection::new(FailureReason::DecodeError, "pod has no spec"))?;

        let mut containers = ContainerSet::from_pod_spec(spec);
        let result = rewrite_pod(
            &mut containers,
            namespace,
            &self.policy,
            self.pull_secret.as_deref(),
        )
        .map_err(|err| {
            let message = match std::error::Error::source(&err) {
                Some(source) => format!("{err}: {source}"),
                None => err.to_string(),
            };
            Rejection::new(FailureReason::RewriteFailed, message)
        })?;

        self.observe(&containers, &result, namespace);

        if !result.changed_any {
            return Ok(None);
        }

        let mut patched = original.clone();
        apply_rewrite(&mut patched, &containers, &result).map_err(|err| {
            Rejection::new(FailureReason::MarshalingFailed, format!("{err:#}"))
        })?;
        Ok(Some(json_patch::diff(&original, &patched)))
    }

    fn observe(&self, containers: &ContainerSet, result: &PodRewrite, namespace: &str) {
        for (container, outcome) in containers.containers.iter().zip(&result.outcomes) {
            let domain = outcome.domain.as_deref().unwrap_or_default();
            self.metrics
                .container_image(outcome.classification, domain, namespace);

            match outcome.classification {
                Classification::Unknown => {
                    info!(domain, namespace, "Found unmapped domain");
                }
                Classification::Mapped => {
                    info!(domain, namespace, "Container image will be rewritten");
                }
                _ => {}
            }

            if outcome.changed {
                info!(
                    old_image = %outcome.original_image,
                    new_image = %outcome.new_image,
                    classification = %outcome.classification,
                    namespace,
                    container_name = %container.name,
                    "Rewriting image"
                );
            }
        }

        if result.pull_secret_attached {
            info!(
                pull_secret = self.pull_secret.as_deref().unwrap_or_default(),
                namespace, "Adding pull secret"
            );
        } else if result.changed_any && self.pull_secret.is_none() {
            info!(
                namespace,
                "No pull secret configured - images rewritten without credentials"
            );
        }
    }
}

/// Writes the rewritten images and pull secrets into the raw pod object,
/// leaving every other field untouched.
fn apply_rewrite(
    object: &mut Value,
    containers: &ContainerSet,
    result: &PodRewrite,
) -> anyhow::Result<()> {
    for (container, outcome) in containers.containers.iter().zip(&result.outcomes) {
        if !outcome.changed {
            continue;
        }
        let pointer = format!(
            "/spec/{}/{}/image",
            container.kind.spec_field(),
            container.index
        );
        let image = object
            .pointer_mut(&pointer)
            .ok_or_else(|| anyhow!("pod object has no field {}", pointer))?;
        *image = Value::String(container.image.clone());
    }

    if result.pull_secret_attached {
        let secrets: Vec<Value> = containers
            .image_pull_secrets
            .iter()
            .flatten()
            .map(|name| json!({ "name": name }))
            .collect();
        object
            .pointer_mut("/spec")
            .and_then(Value::as_object_mut)
            .context("pod object has no spec")?
            .insert("imagePullSecrets".to_string(), Value::Array(secrets));
    }

    Ok(())
}
