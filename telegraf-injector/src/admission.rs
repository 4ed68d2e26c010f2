/// The admission handler adds the telegraf sidecars to incoming pods and cleans up
/// their secrets when pods are deleted.
use std::collections::HashSet;
use std::sync::Arc;

use anyhow::anyhow;
use json_patch::{AddOperation, Patch, PatchOperation};
use jsonptr::Pointer;
use k8s_openapi::api::core::v1::Pod;
use kube::core::{
    admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation},
    DynamicObject,
};
use kube::ResourceExt;
use rand::Rng;
use serde_json::json;
use tracing::{debug, error, info};
use warp::reply;

use crate::secrets::SecretManager;
use crate::sidecar::SidecarHandler;

// Same limits and alphabet as the API server uses for generateName.
const MAX_GENERATED_NAME_LENGTH: usize = 63;
const RANDOM_LENGTH: usize = 5;
const MAX_NAME_PREFIX_LENGTH: usize = MAX_GENERATED_NAME_LENGTH - RANDOM_LENGTH;
const NAME_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";

/// Everything the handler needs, built once at startup.
pub struct InjectorContext {
    pub sidecar: Arc<SidecarHandler>,
    pub secrets: SecretManager,
}

/// Appends random characters to `base`, truncated so the result fits in a
/// resource name.
pub fn generate_name(base: &str) -> String {
    let prefix: String = base.chars().take(MAX_NAME_PREFIX_LENGTH).collect();
    let mut rng = rand::thread_rng();
    let suffix: String = (0..RANDOM_LENGTH)
        .map(|_| NAME_ALPHABET[rng.gen_range(0..NAME_ALPHABET.len())] as char)
        .collect();
    format!("{}{}", prefix, suffix)
}

/// Per RFC 6901, If the currently referenced value is a JSON array, the reference token MUST contain either
/// 1. characters comprised of digits that represent an unsigned base-10 integer value, OR:
/// 2. exactly the single character "-", making the new referenced value the (nonexistent) member
///    after the last array element.
fn is_referencing_an_array(token: &jsonptr::Token) -> bool {
    token.decoded() == "-"
        || token.decoded().chars().all(char::is_numeric)
            && token.decoded().chars().next() != Some('0')
}

/// Implicitly create non-existent documents in the pod JSON and initialize them with an empty value.
fn create_non_existent_values(
    pod: &Pod,
    patches: Vec<PatchOperation>,
) -> serde_json::Result<Vec<PatchOperation>> {
    let mut result = Vec::new();
    let pod_value = serde_json::to_value(pod)?;
    let mut created = HashSet::new();

    for patch in patches {
        let path = patch.path();

        if path.is_root() {
            result.push(patch.clone());
            continue;
        }

        if let Err(jsonptr::Error::NotFound(not_found)) = path.resolve(&pod_value) {
            // The pod JSON contains up to the parent of the missing document, create
            // everything below it.
            let missing = not_found.pointer;
            let mut current_path = missing.clone();
            for token in path.tokens().skip(missing.tokens().count()) {
                let new_value = if is_referencing_an_array(&token) {
                    json!([])
                } else {
                    json!({})
                };
                if !created.contains(&current_path) {
                    result.push(PatchOperation::Add(AddOperation {
                        path: current_path.clone(),
                        value: new_value,
                    }));
                    created.insert(current_path.clone());
                }
                current_path.push_back(token.clone());
            }
        }
        result.push(patch);
    }

    Ok(result)
}

/// The patch turning `original` into `mutated`. Sidecars and volumes are only ever
/// appended, so everything past the original lengths is new.
fn build_patches(
    original: &Pod,
    mutated: &Pod,
    generated_name: Option<&str>,
) -> serde_json::Result<Vec<PatchOperation>> {
    let mut patches = Vec::new();

    if let Some(name) = generated_name {
        patches.push(PatchOperation::Add(AddOperation {
            path: Pointer::new(["metadata", "name"]),
            value: json!(name),
        }));
    }

    let original_spec = original.spec.clone().unwrap_or_default();
    let mutated_spec = mutated.spec.clone().unwrap_or_default();

    for container in mutated_spec.containers.iter().skip(original_spec.containers.len()) {
        patches.push(PatchOperation::Add(AddOperation {
            path: Pointer::new(["spec", "containers", "-"]),
            value: serde_json::to_value(container)?,
        }));
    }

    let original_volumes = original_spec.volumes.map_or(0, |volumes| volumes.len());
    for volume in mutated_spec
        .volumes
        .iter()
        .flatten()
        .skip(original_volumes)
    {
        patches.push(PatchOperation::Add(AddOperation {
            path: Pointer::new(["spec", "volumes", "-"]),
            value: serde_json::to_value(volume)?,
        }));
    }

    create_non_existent_values(original, patches)
}

fn with_warnings(mut response: AdmissionResponse, warnings: Vec<String>) -> AdmissionResponse {
    if !warnings.is_empty() {
        response.warnings = Some(warnings);
    }
    response
}

async fn handle_delete(
    req: &AdmissionRequest<DynamicObject>,
    context: &InjectorContext,
) -> AdmissionResponse {
    let namespace = req.namespace.clone().unwrap_or_default();
    let response = AdmissionResponse::from(req);

    if context.secrets.delete_pod_secrets(&namespace, &req.name).await {
        response
    } else {
        with_warnings(
            response,
            vec!["telegraf-injector couldn't delete one or more secrets".to_string()],
        )
    }
}

/// Decides on the response for one admission request.
pub async fn admit(
    req: &AdmissionRequest<DynamicObject>,
    context: &InjectorContext,
) -> anyhow::Result<AdmissionResponse> {
    if req.operation == Operation::Delete {
        return Ok(handle_delete(req, context).await);
    }

    // Extract the Pod from the request
    let original: Pod = req
        .object
        .clone()
        .ok_or(anyhow!("No object in request"))?
        .try_parse()?;

    if context.sidecar.skip(&original) {
        debug!(
            "skipping pod {:?} as telegraf-injector should not handle it",
            original.metadata.name
        );
        return Ok(AdmissionResponse::from(req));
    }

    let mut pod = original.clone();
    let mut generated_name = None;
    if pod.metadata.name.as_deref().unwrap_or_default().is_empty() {
        let name = generate_name(pod.metadata.generate_name.as_deref().unwrap_or_default());
        debug!("generated pod name {}", name);
        pod.metadata.name = Some(name.clone());
        generated_name = Some(name);
    }

    let name = pod.metadata.name.clone().unwrap_or_default();
    let namespace = req
        .namespace
        .clone()
        .or_else(|| pod.namespace())
        .unwrap_or_default();

    info!(%namespace, %name, "adding sidecar containers");
    let result = match context.sidecar.add_sidecars(&mut pod, &name, &namespace) {
        Ok(result) => result,
        Err(err) => {
            error!(%namespace, %name, "unable to add sidecar containers: {}", err);
            return Ok(AdmissionResponse::from(req).deny(err.to_string()));
        }
    };

    if matches!(req.operation, Operation::Create | Operation::Update) {
        if let Err(err) = context.secrets.create_or_update_secrets(&result.secrets).await {
            error!(%namespace, %name, "unable to create secret: {}", err);
            return Ok(AdmissionResponse::from(req).deny(err.to_string()));
        }
    }

    let patches = build_patches(&original, &pod, generated_name.as_deref())?;
    if patches.is_empty() {
        return Ok(with_warnings(AdmissionResponse::from(req), result.messages));
    }

    let response = AdmissionResponse::from(req).with_patch(Patch(patches))?;
    info!(%namespace, %name, "mutating pod");

    Ok(with_warnings(response, result.messages))
}

pub async fn admission_handler(
    body: AdmissionReview<DynamicObject>,
    context: &InjectorContext,
) -> anyhow::Result<reply::Json> {
    tracing::trace!("Admission Handler request {:?}", body);

    // Parse incoming webhook AdmissionRequest first
    let req: AdmissionRequest<DynamicObject> = body.try_into()?;
    let response = admit(&req, context).await?;

    tracing::debug!("Admission Handler response {:?}", response);

    Ok(warp::reply::json(&response.into_review()))
}
