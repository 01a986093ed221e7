//! Registry client (distribution API v2)

use super::oci::{media_types, sha256_digest, Descriptor};
use super::reference::Reference;
use crate::error::{Result, RuneError};
use async_trait::async_trait;
use base64::Engine;
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, CONTENT_TYPE, LOCATION, WWW_AUTHENTICATE};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, info, warn};

const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.index.v1+json, \
application/vnd.docker.distribution.manifest.list.v2+json, \
application/vnd.oci.image.manifest.v1+json, \
application/vnd.docker.distribution.manifest.v2+json";

/// Source of image content. The registry client is the real one.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Resolve a tag or digest to the top-level descriptor and its bytes
    async fn resolve(&self, reference: &Reference) -> Result<(Descriptor, Vec<u8>)>;
    /// Fetch a manifest or blob by descriptor, verifying its digest
    async fn fetch(&self, reference: &Reference, desc: &Descriptor) -> Result<Vec<u8>>;
}

/// Pushes image content to a registry
#[async_trait]
pub trait Pusher: Send + Sync {
    async fn push_blob(&self, reference: &Reference, desc: &Descriptor, data: Vec<u8>) -> Result<()>;
    async fn push_manifest(&self, reference: &Reference, desc: &Descriptor, data: Vec<u8>) -> Result<()>;
}

/// Token response from an auth server
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// `~/.docker/config.json`
#[derive(Debug, Default, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct AuthEntry {
    #[serde(default)]
    auth: Option<String>,
}

/// Registry client for pulling and pushing images
pub struct RegistryClient {
    client: reqwest::Client,
    insecure: bool,
    /// Hosts that answered only over plain HTTP
    plain_http: Mutex<HashSet<String>>,
    /// Bearer tokens by (host, scope)
    tokens: Mutex<HashMap<(String, String), String>>,
    config_path: Option<PathBuf>,
}

impl RegistryClient {
    /// Create a new registry client
    pub fn new(insecure: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(insecure)
            .user_agent(concat!("runectl/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            insecure,
            plain_http: Mutex::new(HashSet::new()),
            tokens: Mutex::new(HashMap::new()),
            config_path: dirs::home_dir().map(|h| h.join(".docker").join("config.json")),
        })
    }

    fn base_url(&self, host: &str) -> String {
        let plain = self
            .plain_http
            .lock()
            .map(|set| set.contains(host))
            .unwrap_or(false);
        format!("{}://{}", if plain { "http" } else { "https" }, host)
    }

    /// Basic credentials for `host` from the Docker client config
    fn credentials(&self, host: &str) -> Option<(String, String)> {
        let path = self.config_path.as_ref()?;
        let raw = std::fs::read(path).ok()?;
        let config: DockerConfig = serde_json::from_slice(&raw).ok()?;
        let keys: Vec<&str> = if host == "registry-1.docker.io" {
            vec!["https://index.docker.io/v1/", "index.docker.io", "docker.io"]
        } else {
            vec![host]
        };
        let entry = config.auths.iter().find(|(k, _)| {
            let k = k.trim_start_matches("https://").trim_start_matches("http://");
            keys.iter().any(|want| {
                let want = want.trim_start_matches("https://");
                k == want || k.trim_end_matches('/') == want.trim_end_matches('/')
            })
        })?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(entry.1.auth.as_ref()?)
            .ok()?;
        let text = String::from_utf8(decoded).ok()?;
        let (user, pass) = text.split_once(':')?;
        Some((user.to_string(), pass.to_string()))
    }

    async fn fetch_token(&self, host: &str, challenge: &str) -> Result<Option<String>> {
        let params = parse_challenge(challenge);
        let realm = match params.get("realm") {
            Some(r) => r.clone(),
            None => return Ok(None),
        };
        let mut request = self.client.get(&realm);
        let mut query = Vec::new();
        if let Some(service) = params.get("service") {
            query.push(("service", service.clone()));
        }
        if let Some(scope) = params.get("scope") {
            query.push(("scope", scope.clone()));
        }
        request = request.query(&query);
        if let Some((user, pass)) = self.credentials(host) {
            request = request.basic_auth(user, Some(pass));
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(RuneError::Registry(format!(
                "token request to {} failed: {}",
                realm,
                response.status()
            )));
        }
        let token: TokenResponse = response.json().await?;
        Ok(token.token.or(token.access_token))
    }

    /// Send a request, handling auth challenges and the plain HTTP fallback
    async fn send(
        &self,
        method: Method,
        host: &str,
        path: &str,
        headers: HeaderMap,
        body: Option<Vec<u8>>,
        scope: &str,
    ) -> Result<reqwest::Response> {
        let url = if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.base_url(host), path)
        };
        let token_key = (host.to_string(), scope.to_string());

        let build = |url: &str, token: Option<&String>| {
            let mut req = self.client.request(method.clone(), url).headers(headers.clone());
            if let Some(t) = token {
                req = req.header(AUTHORIZATION, format!("Bearer {}", t));
            } else if let Some((user, pass)) = self.credentials(host) {
                req = req.basic_auth(user, Some(pass));
            }
            if let Some(b) = &body {
                req = req.body(b.clone());
            }
            req
        };

        let cached = self.tokens.lock().ok().and_then(|t| t.get(&token_key).cloned());
        let response = match build(&url, cached.as_ref()).send().await {
            Ok(r) => r,
            Err(e) if self.insecure && url.starts_with("https://") && is_protocol_error(&e) => {
                warn!("server {} does not seem to support HTTPS, falling back to plain HTTP: {}", host, e);
                if let Ok(mut set) = self.plain_http.lock() {
                    set.insert(host.to_string());
                }
                let url = url.replacen("https://", "http://", 1);
                build(&url, cached.as_ref()).send().await?
            }
            Err(e) => return Err(e.into()),
        };

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !challenge.to_ascii_lowercase().starts_with("bearer") {
            return Ok(response);
        }
        let token = match self.fetch_token(host, &challenge).await? {
            Some(t) => t,
            None => return Ok(response),
        };
        debug!("obtained registry token for {} ({})", host, scope);
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.insert(token_key, token.clone());
        }
        let url = if path.starts_with("http") {
            path.to_string()
        } else {
            format!("{}{}", self.base_url(host), path)
        };
        Ok(build(&url, Some(&token)).send().await?)
    }

    async fn get_manifest(&self, reference: &Reference, object: &str) -> Result<(String, Vec<u8>)> {
        let host = reference.registry_host().to_string();
        let mut headers = HeaderMap::new();
        if let Ok(v) = MANIFEST_ACCEPT.parse() {
            headers.insert(ACCEPT, v);
        }
        let response = self
            .send(
                Method::GET,
                &host,
                &format!("/v2/{}/manifests/{}", reference.path, object),
                headers,
                None,
                &pull_scope(reference),
            )
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(RuneError::ImageNotFound(reference.to_string()));
        }
        if !response.status().is_success() {
            return Err(RuneError::Registry(format!(
                "failed to fetch manifest {}: {}",
                object,
                response.status()
            )));
        }
        let media_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_string();
        let body = response.bytes().await?.to_vec();
        Ok((media_type, body))
    }

    /// Check if a blob exists
    pub async fn blob_exists(&self, reference: &Reference, digest: &str) -> Result<bool> {
        let response = self
            .send(
                Method::HEAD,
                reference.registry_host(),
                &format!("/v2/{}/blobs/{}", reference.path, digest),
                HeaderMap::new(),
                None,
                &push_scope(reference),
            )
            .await?;
        Ok(response.status().is_success())
    }
}

#[async_trait]
impl Fetcher for RegistryClient {
    async fn resolve(&self, reference: &Reference) -> Result<(Descriptor, Vec<u8>)> {
        let (header_type, body) = self.get_manifest(reference, reference.object()).await?;
        let digest = sha256_digest(&body);
        if let Some(expected) = &reference.digest {
            if expected != &digest {
                return Err(RuneError::Registry(format!(
                    "manifest digest mismatch: expected {}, got {}",
                    expected, digest
                )));
            }
        }
        let media_type = if header_type.is_empty() || header_type == "application/json" {
            sniff_media_type(&body)
        } else {
            header_type
        };
        info!("resolved {} to {}", reference, digest);
        Ok((
            Descriptor {
                media_type,
                digest,
                size: body.len() as i64,
                ..Descriptor::default()
            },
            body,
        ))
    }

    async fn fetch(&self, reference: &Reference, desc: &Descriptor) -> Result<Vec<u8>> {
        let data = if media_types::is_index(&desc.media_type) || media_types::is_manifest(&desc.media_type) {
            self.get_manifest(reference, &desc.digest).await?.1
        } else {
            let response = self
                .send(
                    Method::GET,
                    reference.registry_host(),
                    &format!("/v2/{}/blobs/{}", reference.path, desc.digest),
                    HeaderMap::new(),
                    None,
                    &pull_scope(reference),
                )
                .await?;
            if !response.status().is_success() {
                return Err(RuneError::Registry(format!(
                    "failed to fetch blob {}: {}",
                    desc.digest,
                    response.status()
                )));
            }
            response.bytes().await?.to_vec()
        };
        let digest = sha256_digest(&data);
        if digest != desc.digest {
            return Err(RuneError::Registry(format!(
                "digest mismatch for {}: got {}",
                desc.digest, digest
            )));
        }
        Ok(data)
    }
}

#[async_trait]
impl Pusher for RegistryClient {
    async fn push_blob(&self, reference: &Reference, desc: &Descriptor, data: Vec<u8>) -> Result<()> {
        if self.blob_exists(reference, &desc.digest).await? {
            debug!("blob {} already present", desc.digest);
            return Ok(());
        }
        let host = reference.registry_host().to_string();
        let scope = push_scope(reference);

        // Start upload
        let response = self
            .send(
                Method::POST,
                &host,
                &format!("/v2/{}/blobs/uploads/", reference.path),
                HeaderMap::new(),
                None,
                &scope,
            )
            .await?;
        if !response.status().is_success() {
            return Err(RuneError::Registry(format!(
                "failed to start blob upload: {}",
                response.status()
            )));
        }
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| RuneError::Registry("no upload location provided".to_string()))?
            .to_string();
        let location = if location.starts_with('/') {
            format!("{}{}", self.base_url(&host), location)
        } else {
            location
        };
        let sep = if location.contains('?') { '&' } else { '?' };

        // Complete upload
        let mut headers = HeaderMap::new();
        if let Ok(v) = "application/octet-stream".parse() {
            headers.insert(CONTENT_TYPE, v);
        }
        let response = self
            .send(
                Method::PUT,
                &host,
                &format!("{}{}digest={}", location, sep, desc.digest),
                headers,
                Some(data),
                &scope,
            )
            .await?;
        if !response.status().is_success() {
            return Err(RuneError::Registry(format!(
                "failed to complete blob upload {}: {}",
                desc.digest,
                response.status()
            )));
        }
        Ok(())
    }

    async fn push_manifest(&self, reference: &Reference, desc: &Descriptor, data: Vec<u8>) -> Result<()> {
        let mut headers = HeaderMap::new();
        if let Ok(v) = desc.media_type.parse() {
            headers.insert(CONTENT_TYPE, v);
        }
        let response = self
            .send(
                Method::PUT,
                reference.registry_host(),
                &format!("/v2/{}/manifests/{}", reference.path, reference.object()),
                headers,
                Some(data),
                &push_scope(reference),
            )
            .await?;
        if !response.status().is_success() {
            return Err(RuneError::Registry(format!(
                "failed to push manifest: {}",
                response.status()
            )));
        }
        Ok(())
    }
}

fn pull_scope(reference: &Reference) -> String {
    format!("repository:{}:pull", reference.path)
}

fn push_scope(reference: &Reference) -> String {
    format!("repository:{}:pull,push", reference.path)
}

/// Errors that suggest the server speaks plain HTTP
fn is_protocol_error(e: &reqwest::Error) -> bool {
    if e.is_connect() {
        return true;
    }
    let mut source: Option<&dyn std::error::Error> = Some(e);
    while let Some(err) = source {
        let msg = err.to_string().to_ascii_lowercase();
        if msg.contains("tls") || msg.contains("ssl") || msg.contains("certificate") || msg.contains("http2") {
            return true;
        }
        source = err.source();
    }
    false
}

/// Split `Bearer realm="..",service="..",scope=".."`
fn parse_challenge(header: &str) -> HashMap<String, String> {
    let rest = header
        .split_once(' ')
        .map(|(_, r)| r)
        .unwrap_or_default();
    let mut out = HashMap::new();
    let mut key = String::new();
    let mut value = String::new();
    let mut in_quotes = false;
    let mut in_value = false;
    for c in rest.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            '=' if !in_quotes && !in_value => in_value = true,
            ',' if !in_quotes => {
                out.insert(key.trim().to_string(), value.clone());
                key.clear();
                value.clear();
                in_value = false;
            }
            _ if in_value => value.push(c),
            _ => key.push(c),
        }
    }
    if !key.trim().is_empty() {
        out.insert(key.trim().to_string(), value);
    }
    out
}

/// Media type of a manifest body that came without a useful header
fn sniff_media_type(body: &[u8]) -> String {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Probe {
        #[serde(default)]
        media_type: Option<String>,
        #[serde(default)]
        manifests: Option<serde_json::Value>,
    }
    match serde_json::from_slice::<Probe>(body) {
        Ok(Probe { media_type: Some(mt), .. }) => mt,
        Ok(Probe { manifests: Some(_), .. }) => media_types::OCI_INDEX.to_string(),
        _ => media_types::OCI_MANIFEST.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_challenge() {
        let params = parse_challenge(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/alpine:pull""#,
        );
        assert_eq!(params["realm"], "https://auth.docker.io/token");
        assert_eq!(params["service"], "registry.docker.io");
        assert_eq!(params["scope"], "repository:library/alpine:pull");
    }

    #[test]
    fn test_sniff_media_type() {
        assert_eq!(sniff_media_type(br#"{"manifests": []}"#), media_types::OCI_INDEX);
        assert_eq!(
            sniff_media_type(br#"{"mediaType": "application/vnd.docker.distribution.manifest.v2+json"}"#),
            media_types::MANIFEST_V2
        );
        assert_eq!(sniff_media_type(b"{}"), media_types::OCI_MANIFEST);
    }

    #[test]
    fn test_credentials_from_docker_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let auth = base64::engine::general_purpose::STANDARD.encode("alice:s3cret");
        std::fs::write(
            &path,
            format!(r#"{{"auths": {{"https://index.docker.io/v1/": {{"auth": "{}"}}, "ghcr.io": {{"auth": "{}"}}}}}}"#, auth, auth),
        )
        .unwrap();
        let mut client = RegistryClient::new(false).unwrap();
        client.config_path = Some(path);
        assert_eq!(
            client.credentials("registry-1.docker.io"),
            Some(("alice".to_string(), "s3cret".to_string()))
        );
        assert!(client.credentials("ghcr.io").is_some());
        assert!(client.credentials("quay.io").is_none());
    }

    #[test]
    fn test_scopes() {
        let r = Reference::parse("alpine").unwrap();
        assert_eq!(pull_scope(&r), "repository:library/alpine:pull");
        assert_eq!(push_scope(&r), "repository:library/alpine:pull,push");
    }
}
