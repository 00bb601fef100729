//! HTTP package registry
//!
//! `GET {base}/{name}` returns the package document (all versions with their
//! dependencies and integrity); tarballs live at
//! `{base}/{name}/-/{basename}-{version}.tgz`. Only the document URL encodes
//! the scope separator (`@scope%2Fpkg`); tarball paths keep `@scope/pkg`.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

use semver::Version;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::DEFAULT_REGISTRY_URL;
use crate::source::error::FetchError;
use crate::source::integrity::Integrity;
use crate::source::types::{PackageMetadata, Payload, PinnedPackage, SourceKind, VersionListing};
use crate::source::Source;
use crate::version::Requirement;
use crate::version::semver::parse_version;

/// File name of a downloaded tarball inside the staging directory
pub const TARBALL_FILE: &str = "package.tgz";

#[derive(Debug, Deserialize)]
struct RegistryDocument {
    #[serde(default)]
    latest: Option<String>,
    #[serde(default)]
    versions: Vec<RegistryVersion>,
}

#[derive(Debug, Deserialize)]
struct RegistryVersion {
    version: String,
    #[serde(default)]
    dependencies: BTreeMap<String, String>,
    integrity: String,
}

pub struct RegistrySource {
    client: reqwest::Client,
    base_url: String,
    /// Package documents already fetched during this run
    documents: Mutex<HashMap<String, Arc<RegistryDocument>>>,
}

impl RegistrySource {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::builder()
                .user_agent(concat!("depot/", env!("CARGO_PKG_VERSION")))
                .build()
                .expect("Failed to create HTTP client"),
            base_url: base_url.trim_end_matches('/').to_string(),
            documents: Mutex::new(HashMap::new()),
        }
    }

    /// Encode package name for URL (handles scoped packages)
    fn encode_name(name: &str) -> String {
        if name.starts_with('@') {
            name.replace('/', "%2F")
        } else {
            name.to_string()
        }
    }

    fn document_url(&self, name: &str) -> String {
        format!("{}/{}", self.base_url, Self::encode_name(name))
    }

    pub fn tarball_url(&self, name: &str, version: &Version) -> String {
        let basename = name.rsplit('/').next().unwrap_or(name);
        format!("{}/{}/-/{}-{}.tgz", self.base_url, name, basename, version)
    }

    async fn document(&self, name: &str) -> Result<Arc<RegistryDocument>, FetchError> {
        if let Ok(documents) = self.documents.lock()
            && let Some(doc) = documents.get(name)
        {
            return Ok(Arc::clone(doc));
        }

        let url = self.document_url(name);
        debug!("Fetching registry document {}", url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| FetchError::from_transport(e, &url))?;
        let response = check_status(response, name).await?;

        let doc: RegistryDocument = response.json().await.map_err(|e| {
            warn!("Failed to parse registry response for {}: {}", name, e);
            FetchError::InvalidResponse(e.to_string())
        })?;
        let doc = Arc::new(doc);

        if let Ok(mut documents) = self.documents.lock() {
            documents.insert(name.to_string(), Arc::clone(&doc));
        }
        Ok(doc)
    }

    /// Upload a packed tarball as `name@version`
    pub async fn publish(
        &self,
        name: &str,
        version: &Version,
        tarball: Vec<u8>,
    ) -> Result<(), FetchError> {
        let url = self.document_url(name);
        let integrity = Integrity::of_bytes(&tarball);
        debug!("Publishing {}@{} ({}) to {}", name, version, integrity, url);

        let response = self
            .client
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/gzip")
            .header("X-Package-Version", version.to_string())
            .header("X-Package-Integrity", integrity.to_string())
            .body(tarball)
            .send()
            .await
            .map_err(|e| FetchError::from_transport(e, &url))?;
        check_status(response, name).await?;
        Ok(())
    }
}

impl Default for RegistrySource {
    fn default() -> Self {
        Self::new(DEFAULT_REGISTRY_URL)
    }
}

/// Map non-success responses to fetch errors
async fn check_status(
    response: reqwest::Response,
    name: &str,
) -> Result<reqwest::Response, FetchError> {
    let status = response.status();

    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(FetchError::NotFound(name.to_string()));
    }

    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        return Err(FetchError::RateLimited {
            retry_after_secs: retry_after,
        });
    }

    if !status.is_success() {
        warn!("Registry returned status {}: {}", status, response.url());
        return Err(FetchError::UnexpectedStatus {
            status: status.as_u16(),
            url: response.url().to_string(),
        });
    }

    Ok(response)
}

#[async_trait::async_trait]
impl Source for RegistrySource {
    fn kind(&self) -> SourceKind {
        SourceKind::Registry
    }

    async fn fetch_versions(&self, name: &str) -> Result<VersionListing, FetchError> {
        let doc = self.document(name).await?;

        let versions = doc
            .versions
            .iter()
            .filter_map(|entry| {
                let parsed = parse_version(&entry.version);
                if parsed.is_none() {
                    warn!("Skipping unparseable version {} of {}", entry.version, name);
                }
                parsed
            })
            .collect();
        let latest = doc.latest.as_deref().and_then(parse_version);

        Ok(VersionListing::new(name, versions, latest))
    }

    async fn fetch_metadata(
        &self,
        name: &str,
        version: &Version,
    ) -> Result<PackageMetadata, FetchError> {
        let doc = self.document(name).await?;
        let entry = doc
            .versions
            .iter()
            .find(|entry| parse_version(&entry.version).as_ref() == Some(version))
            .ok_or_else(|| FetchError::NotFound(format!("{name}@{version}")))?;

        let dependencies = entry
            .dependencies
            .iter()
            .map(|(dep, raw)| {
                Requirement::parse(raw)
                    .map(|req| (dep.clone(), req))
                    .map_err(|e| FetchError::InvalidResponse(format!("{name}@{version}: {e}")))
            })
            .collect::<Result<BTreeMap<_, _>, _>>()?;

        let integrity = Integrity::parse(&entry.integrity).ok_or_else(|| {
            FetchError::InvalidResponse(format!(
                "{name}@{version}: invalid integrity {}",
                entry.integrity
            ))
        })?;

        Ok(PackageMetadata {
            name: name.to_string(),
            version: version.clone(),
            dependencies,
            source: SourceKind::Registry,
            location: self.tarball_url(name, version),
            integrity,
        })
    }

    async fn fetch_artifact(
        &self,
        package: &PinnedPackage,
        staging: &Path,
    ) -> Result<Payload, FetchError> {
        let url = self.tarball_url(&package.name, &package.version);
        debug!("Downloading {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| FetchError::from_transport(e, &url))?;
        let response = check_status(response, &package.to_string()).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| FetchError::from_transport(e, &url))?;

        let actual = Integrity::of_bytes(&bytes);
        if actual != package.integrity {
            return Err(FetchError::IntegrityViolation {
                name: package.name.clone(),
                version: package.version.to_string(),
                expected: package.integrity.to_string(),
                actual: actual.to_string(),
            });
        }

        let path = staging.join(TARBALL_FILE);
        tokio::fs::write(&path, &bytes).await?;
        Ok(Payload::Tarball(path))
    }
}
