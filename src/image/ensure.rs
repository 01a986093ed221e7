//! Image ensurer: make a reference usable as a container root

use super::oci::{ImageConfigFile, Platform};
use super::reference::Reference;
use super::registry::Fetcher;
use super::store::{Image, ImageStore};
use super::verify::Verifier;
use crate::daemon::Scope;
use crate::error::{Result, RuneError};
use tracing::{debug, warn};

/// `--pull` policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PullPolicy {
    Always,
    #[default]
    Missing,
    Never,
}

impl std::str::FromStr for PullPolicy {
    type Err = RuneError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "always" => Ok(PullPolicy::Always),
            "missing" => Ok(PullPolicy::Missing),
            "never" => Ok(PullPolicy::Never),
            other => Err(RuneError::usage(format!("invalid pull policy {:?}", other))),
        }
    }
}

/// A reference resolved, pulled if needed and unpacked
#[derive(Debug, Clone)]
pub struct EnsuredImage {
    pub reference: Reference,
    pub image: Image,
    pub snapshotter: String,
    /// Top chain id on `snapshotter`
    pub chain_id: String,
}

impl EnsuredImage {
    pub fn config(&self) -> &ImageConfigFile {
        &self.image.config
    }
}

pub struct EnsureOptions<'a> {
    pub policy: PullPolicy,
    pub platform: Platform,
    pub fetcher: &'a dyn Fetcher,
    pub verifier: Option<&'a dyn Verifier>,
}

/// Resolve `raw`, pulling per `opts.policy`, and unpack it on the store's snapshotter
pub async fn ensure_image(
    store: &ImageStore,
    scope: &Scope,
    raw: &str,
    opts: &EnsureOptions<'_>,
) -> Result<EnsuredImage> {
    let reference = Reference::parse(raw)?;

    let existing = if opts.policy == PullPolicy::Always {
        None
    } else {
        store.get(scope, &reference).await?
    };

    let (record, pulled) = match existing {
        Some(record) => {
            debug!("image {} present, skipping pull", reference);
            (record, false)
        }
        None if opts.policy == PullPolicy::Never => {
            return Err(RuneError::ImageNotFound(reference.to_string()));
        }
        None => (store.pull(scope, &reference, &opts.platform, opts.fetcher).await?, true),
    };

    let image = store.read_image(scope, &record, &opts.platform).await?;
    let chain_id = store.unpack(scope, &image).await?;

    if let Some(verifier) = opts.verifier {
        if let Err(e) = verifier.verify(&reference).await {
            if pulled {
                let cleanup = Scope::new(scope.namespace());
                if let Err(del) = store.delete(&cleanup, &record.name).await {
                    warn!("failed to delete unverified image {}: {}", record.name, del);
                }
            }
            return Err(e);
        }
    }

    Ok(EnsuredImage {
        reference,
        image,
        snapshotter: store.snapshotter().to_string(),
        chain_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::fake::FakeBackend;
    use crate::daemon::Client;
    use crate::image::oci::ContainerConfig;
    use crate::image::store::tests::MemoryRegistry;
    use async_trait::async_trait;

    struct Reject;

    #[async_trait]
    impl Verifier for Reject {
        async fn verify(&self, reference: &Reference) -> Result<()> {
            Err(RuneError::ImageVerificationFailed {
                reference: reference.to_string(),
                reason: "no signatures found".into(),
            })
        }
    }

    fn setup() -> (FakeBackend, ImageStore, Scope, MemoryRegistry) {
        let fake = FakeBackend::default();
        let store = ImageStore::new(Client::from_backend(fake.clone()), "overlayfs");
        let mut registry = MemoryRegistry::default();
        registry.publish(
            "alpine",
            ContainerConfig {
                cmd: Some(vec!["/bin/sh".into()]),
                ..Default::default()
            },
            true,
        );
        (fake, store, Scope::new("default"), registry)
    }

    fn opts(registry: &MemoryRegistry, policy: PullPolicy) -> EnsureOptions<'_> {
        EnsureOptions {
            policy,
            platform: Platform::host(),
            fetcher: registry,
            verifier: None,
        }
    }

    #[tokio::test]
    async fn test_missing_policy_pulls_once() {
        let (_fake, store, scope, registry) = setup();
        let ensured = ensure_image(&store, &scope, "alpine", &opts(&registry, PullPolicy::Missing))
            .await
            .unwrap();
        assert_eq!(ensured.reference.to_string(), "docker.io/library/alpine:latest");
        assert_eq!(ensured.config().config.cmd, Some(vec!["/bin/sh".to_string()]));
        assert_eq!(Some(ensured.chain_id.clone()), ensured.image.chain_id());
        let fetched = registry.fetched.lock().unwrap().len();

        ensure_image(&store, &scope, "alpine:latest", &opts(&registry, PullPolicy::Missing))
            .await
            .unwrap();
        assert_eq!(registry.fetched.lock().unwrap().len(), fetched);
    }

    #[tokio::test]
    async fn test_never_policy_requires_local_image() {
        let (_fake, store, scope, registry) = setup();
        let err = ensure_image(&store, &scope, "alpine", &opts(&registry, PullPolicy::Never))
            .await
            .unwrap_err();
        assert!(matches!(err, RuneError::ImageNotFound(_)));
    }

    #[tokio::test]
    async fn test_always_policy_resolves_again() {
        let (_fake, store, scope, registry) = setup();
        ensure_image(&store, &scope, "alpine", &opts(&registry, PullPolicy::Missing))
            .await
            .unwrap();
        // The index and selected manifest are fetched again even though blobs are present.
        let before = registry.fetched.lock().unwrap().len();
        ensure_image(&store, &scope, "alpine", &opts(&registry, PullPolicy::Always))
            .await
            .unwrap();
        assert_eq!(registry.fetched.lock().unwrap().len(), before + 1);
    }

    #[tokio::test]
    async fn test_failed_verification_deletes_pulled_image() {
        let (_fake, store, scope, registry) = setup();
        let reject = Reject;
        let mut o = opts(&registry, PullPolicy::Missing);
        o.verifier = Some(&reject);
        let err = ensure_image(&store, &scope, "alpine", &o).await.unwrap_err();
        assert!(matches!(err, RuneError::ImageVerificationFailed { .. }));
        let reference = Reference::parse("alpine").unwrap();
        assert!(store.get(&scope, &reference).await.unwrap().is_none());
    }

    #[test]
    fn test_pull_policy_parse() {
        assert_eq!("never".parse::<PullPolicy>().unwrap(), PullPolicy::Never);
        assert!("sometimes".parse::<PullPolicy>().is_err());
    }
}
