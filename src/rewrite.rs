use crate::image_reference::{ImageReference, ParseError, is_short_identifier};
use crate::policy::{Classification, RewritePolicy};
use k8s_openapi::api::core::v1::{Container, PodSpec};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteOutcome {
    pub original_image: String,
    pub new_image: String,
    pub changed: bool,
    pub classification: Classification,
    /// Normalized registry domain, absent for short identifiers.
    pub domain: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Regular,
    Init,
}

impl ContainerKind {
    /// Field name of the container list inside a pod spec.
    pub fn spec_field(&self) -> &'static str {
        match self {
            ContainerKind::Regular => "containers",
            ContainerKind::Init => "initContainers",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerImage {
    pub name: String,
    pub kind: ContainerKind,
    /// Position within its own list (`containers` or `initContainers`).
    pub index: usize,
    pub image: String,
}

/// The images of one pod, regular containers first, plus its pull secret slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSet {
    pub containers: Vec<ContainerImage>,
    pub image_pull_secrets: Option<Vec<String>>,
}

impl ContainerSet {
    pub fn from_pod_spec(spec: &PodSpec) -> Self {
        let regular = container_images(&spec.containers, ContainerKind::Regular);
        let init = spec
            .init_containers
            .as_deref()
            .map(|containers| container_images(containers, ContainerKind::Init))
            .unwrap_or_default();

        Self {
            containers: regular.into_iter().chain(init).collect(),
            image_pull_secrets: spec
                .image_pull_secrets
                .as_ref()
                .map(|secrets| secrets.iter().map(|s| s.name.clone()).collect()),
        }
    }
}

fn container_images(containers: &[Container], kind: ContainerKind) -> Vec<ContainerImage> {
    containers
        .iter()
        .enumerate()
        .map(|(index, container)| ContainerImage {
            name: container.name.clone(),
            kind,
            index,
            // A missing image fails to parse and rejects the pod
            image: container.image.clone().unwrap_or_default(),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodRewrite {
    pub changed_any: bool,
    /// One outcome per entry of [`ContainerSet::containers`], same order.
    pub outcomes: Vec<RewriteOutcome>,
    pub pull_secret_attached: bool,
}

#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("unable to parse image {image} in namespace {namespace}")]
    Image {
        image: String,
        namespace: String,
        #[source]
        source: ParseError,
    },
    #[error("unable to parse image {image} of container {container} in namespace {namespace}")]
    Container {
        container: String,
        image: String,
        namespace: String,
        #[source]
        source: ParseError,
    },
}

impl RewriteError {
    fn in_container(self, container: &str) -> Self {
        match self {
            RewriteError::Image {
                image,
                namespace,
                source,
            } => RewriteError::Container {
                container: container.to_string(),
                image,
                namespace,
                source,
            },
            other => other,
        }
    }
}

/// Rewrites a single image reference according to `policy`.
///
/// Only mapped and ignored images are rebuilt from their normalized form.
/// Unknown registries and mirror domains keep the exact input string.
pub fn rewrite_image(
    image: &str,
    namespace: &str,
    policy: &RewritePolicy,
) -> Result<RewriteOutcome, RewriteError> {
    if is_short_identifier(image) {
        return Ok(unchanged(image, Classification::ShortIdentifier, None));
    }

    let reference = ImageReference::parse(image).map_err(|source| RewriteError::Image {
        image: image.to_string(),
        namespace: namespace.to_string(),
        source,
    })?;
    let decision = policy.evaluate(&reference.domain);

    if matches!(
        decision.classification,
        Classification::PassthroughAlreadyMirrored | Classification::Unknown
    ) {
        return Ok(unchanged(
            image,
            decision.classification,
            Some(reference.domain),
        ));
    }

    let new_image = reference.rebuild(&decision.target_domain);
    Ok(RewriteOutcome {
        changed: new_image != image,
        original_image: image.to_string(),
        new_image,
        classification: decision.classification,
        domain: Some(reference.domain),
    })
}

fn unchanged(image: &str, classification: Classification, domain: Option<String>) -> RewriteOutcome {
    RewriteOutcome {
        original_image: image.to_string(),
        new_image: image.to_string(),
        changed: false,
        classification,
        domain,
    }
}

/// Rewrites every image of the pod. Nothing in `containers` is modified
/// unless all images parse.
///
/// When an image changed and `pull_secret` is non-empty, the pull secrets are
/// replaced by that single secret.
pub fn rewrite_pod(
    containers: &mut ContainerSet,
    namespace: &str,
    policy: &RewritePolicy,
    pull_secret: Option<&str>,
) -> Result<PodRewrite, RewriteError> {
    let outcomes = containers
        .containers
        .iter()
        .map(|container| {
            rewrite_image(&container.image, namespace, policy)
                .map_err(|err| err.in_container(&container.name))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut changed_any = false;
    for (container, outcome) in containers.containers.iter_mut().zip(&outcomes) {
        if outcome.changed {
            container.image = outcome.new_image.clone();
            changed_any = true;
        }
    }

    let pull_secret = pull_secret.filter(|name| !name.is_empty());
    let pull_secret_attached = match pull_secret {
        Some(name) if changed_any => {
            containers.image_pull_secrets = Some(vec![name.to_string()]);
            true
        }
        _ => false,
    };

    Ok(PodRewrite {
        changed_any,
        outcomes,
        pull_secret_attached,
    })
}
