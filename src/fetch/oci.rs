use std::collections::HashMap;
use std::env;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use flate2::read::GzDecoder;
use oci_distribution::client::{Client, ClientConfig, ClientProtocol};
use oci_distribution::errors::{OciDistributionError, OciErrorCode};
use oci_distribution::manifest;
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::Reference;
use serde::Deserialize;
use tar::Archive;
use tracing::debug;

use crate::error::{Error, Result};
use crate::manifest::{OciLock, OciRef};
use crate::utils::{self, CancelToken};

/// Resolves the image tag to a registry digest, pulls the pinned image, and
/// materializes the layer tree under `directory` into `dest`.
pub async fn fetch(oci_ref: &OciRef, dest: &Path, cancel: &CancelToken) -> Result<OciLock> {
    let image = parse_reference(&oci_ref.image)?;
    let auth = docker_config_auth(image.registry());
    let client = registry_client();

    cancel.check()?;
    let digest = client
        .fetch_manifest_digest(&image, &auth)
        .await
        .map_err(|e| map_oci_error(&oci_ref.image, e))?;
    debug!(image = %oci_ref.image, %digest, "resolved image digest");

    pull_subtree(&client, &image, &auth, &digest, &oci_ref.directory, dest, cancel).await?;
    Ok(OciLock {
        image: oci_ref.image.clone(),
        directory: oci_ref.directory.clone(),
        digest,
    })
}

/// Re-materializes a previously resolved digest.
pub async fn fetch_lock(lock: &OciLock, dest: &Path, cancel: &CancelToken) -> Result<()> {
    let image = parse_reference(&lock.image)?;
    let auth = docker_config_auth(image.registry());
    let client = registry_client();
    pull_subtree(
        &client,
        &image,
        &auth,
        &lock.digest,
        &lock.directory,
        dest,
        cancel,
    )
    .await
}

async fn pull_subtree(
    client: &Client,
    image: &Reference,
    auth: &RegistryAuth,
    digest: &str,
    directory: &str,
    dest: &Path,
    cancel: &CancelToken,
) -> Result<()> {
    cancel.check()?;
    let pinned = Reference::with_digest(
        image.registry().to_string(),
        image.repository().to_string(),
        digest.to_string(),
    );
    let accepted = vec![
        manifest::IMAGE_LAYER_MEDIA_TYPE,
        manifest::IMAGE_LAYER_GZIP_MEDIA_TYPE,
        manifest::IMAGE_DOCKER_LAYER_TAR_MEDIA_TYPE,
        manifest::IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE,
    ];
    let image_data = client
        .pull(&pinned, auth, accepted)
        .await
        .map_err(|e| map_oci_error(&pinned.to_string(), e))?;

    cancel.check()?;
    let scratch = tempfile::Builder::new().prefix("krmpkg-oci-").tempdir()?;
    for layer in &image_data.layers {
        // Later layers overwrite earlier ones, as in the image itself.
        if layer.media_type.contains("gzip") {
            Archive::new(GzDecoder::new(layer.data.as_slice())).unpack(scratch.path())?;
        } else {
            Archive::new(layer.data.as_slice()).unpack(scratch.path())?;
        }
    }

    let source = if directory == "." {
        scratch.path().to_path_buf()
    } else {
        scratch.path().join(directory)
    };
    if !source.is_dir() {
        return Err(Error::InvalidDirectory {
            source_name: image.whole(),
            directory: directory.to_string(),
        });
    }
    utils::copy_dir_contents(&source, dest)?;
    Ok(())
}

fn parse_reference(image: &str) -> Result<Reference> {
    image.parse().map_err(|_| Error::InvalidRef {
        source_name: image.to_string(),
        reference: image.to_string(),
    })
}

fn registry_client() -> Client {
    Client::new(ClientConfig {
        protocol: ClientProtocol::Https,
        ..Default::default()
    })
}

#[derive(Deserialize)]
struct DockerAuthConfig {
    auth: Option<String>,
}

#[derive(Deserialize)]
struct DockerConfig {
    auths: Option<HashMap<String, DockerAuthConfig>>,
}

/// Basic-auth credentials from the docker config file, anonymous otherwise.
fn docker_config_auth(registry: &str) -> RegistryAuth {
    let config_path = env::var_os("DOCKER_CONFIG")
        .map(|dir| Path::new(&dir).to_path_buf())
        .or_else(|| env::var_os("HOME").map(|home| Path::new(&home).join(".docker")))
        .map(|dir| dir.join("config.json"));

    let Some(path) = config_path else {
        return RegistryAuth::Anonymous;
    };
    let Ok(file) = File::open(&path) else {
        debug!(path = %path.display(), "no docker config, using anonymous auth");
        return RegistryAuth::Anonymous;
    };
    let Ok(config) = serde_json::from_reader::<_, DockerConfig>(BufReader::new(file)) else {
        return RegistryAuth::Anonymous;
    };
    let Some(entry) = config.auths.and_then(|mut auths| auths.remove(registry)) else {
        return RegistryAuth::Anonymous;
    };
    let Some(decoded) = entry
        .auth
        .and_then(|raw| BASE64_STANDARD.decode(raw).ok())
        .and_then(|bytes| String::from_utf8(bytes).ok())
    else {
        return RegistryAuth::Anonymous;
    };
    match decoded.split_once(':') {
        Some((user, pass)) => {
            debug!(registry, "using basic auth from docker config");
            RegistryAuth::Basic(user.to_string(), pass.to_string())
        }
        None => RegistryAuth::Anonymous,
    }
}

fn map_oci_error(image: &str, error: OciDistributionError) -> Error {
    match error {
        OciDistributionError::RegistryError { envelope, .. } => {
            let not_found = envelope.errors.iter().any(|e| {
                matches!(
                    e.code,
                    OciErrorCode::ManifestUnknown | OciErrorCode::NameUnknown
                )
            });
            if not_found {
                Error::InvalidRef {
                    source_name: image.to_string(),
                    reference: image.to_string(),
                }
            } else if envelope
                .errors
                .iter()
                .any(|e| matches!(e.code, OciErrorCode::Unauthorized | OciErrorCode::Denied))
            {
                Error::AuthRequired(image.to_string())
            } else {
                Error::UpstreamUnavailable(image.to_string())
            }
        }
        OciDistributionError::AuthenticationFailure(_) => Error::AuthRequired(image.to_string()),
        OciDistributionError::UnauthorizedError { .. } => Error::AuthRequired(image.to_string()),
        _ => Error::UpstreamUnavailable(image.to_string()),
    }
}
