//! Image store - resolve, pull, unpack and delete images in the daemon

use super::oci::{
    chain_ids, media_types, Descriptor, ImageConfigFile, ImageIndex, ImageManifest, Platform,
};
use super::reference::Reference;
use super::registry::{Fetcher, Pusher};
use crate::daemon::{Client, ImageRecord, Scope};
use crate::error::{Result, RuneError};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

pub const LABEL_GC_CONFIG: &str = "containerd.io/gc.ref.content.config";
pub const LABEL_GC_SNAPSHOT_PREFIX: &str = "containerd.io/gc.ref.snapshot.";

/// An image record together with its resolved documents
#[derive(Debug, Clone)]
pub struct Image {
    pub record: ImageRecord,
    pub manifest_digest: String,
    pub manifest: ImageManifest,
    pub config: ImageConfigFile,
}

impl Image {
    /// Image ID: the config digest
    pub fn id(&self) -> &str {
        &self.manifest.config.digest
    }

    /// Chain id of the topmost layer, the snapshot parent for containers
    pub fn chain_id(&self) -> Option<String> {
        chain_ids(&self.config.rootfs.diff_ids).pop()
    }

    /// Compressed size of config and layers
    pub fn size(&self) -> i64 {
        self.manifest.config.size + self.manifest.layers.iter().map(|l| l.size).sum::<i64>()
    }
}

/// Image operations over the daemon's image, content and snapshot services
#[derive(Clone)]
pub struct ImageStore {
    client: Client,
    snapshotter: String,
}

impl ImageStore {
    pub fn new(client: Client, snapshotter: &str) -> Self {
        Self {
            client,
            snapshotter: snapshotter.to_string(),
        }
    }

    pub fn snapshotter(&self) -> &str {
        &self.snapshotter
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Find an image by reference, or by a prefix of its ID or manifest digest
    pub async fn resolve(&self, scope: &Scope, raw: &str) -> Result<Option<ImageRecord>> {
        if let Ok(reference) = Reference::parse(raw) {
            if let Some(record) = self.client.images.get(scope, &reference.to_string()).await? {
                return Ok(Some(record));
            }
        }
        let want = raw.trim_start_matches("sha256:");
        if want.len() < 4 || !want.chars().all(|c| c.is_ascii_hexdigit()) {
            return Ok(None);
        }
        for record in self.client.images.list(scope).await? {
            if super::oci::digest_hex(&record.target.digest).starts_with(want) {
                return Ok(Some(record));
            }
            if let Ok(image) = self.read_image(scope, &record, &Platform::host()).await {
                if super::oci::digest_hex(image.id()).starts_with(want) {
                    return Ok(Some(record));
                }
            }
        }
        Ok(None)
    }

    pub async fn get(&self, scope: &Scope, reference: &Reference) -> Result<Option<ImageRecord>> {
        self.client.images.get(scope, &reference.to_string()).await
    }

    pub async fn list(&self, scope: &Scope) -> Result<Vec<ImageRecord>> {
        self.client.images.list(scope).await
    }

    pub async fn delete(&self, scope: &Scope, name: &str) -> Result<()> {
        self.client.images.delete(scope, name).await
    }

    /// Point `target` at the same content as `source`
    pub async fn tag(&self, scope: &Scope, source: &ImageRecord, target: &Reference) -> Result<ImageRecord> {
        let mut record = ImageRecord::new(&target.to_string(), source.target.clone());
        record.labels = source.labels.clone();
        self.client.images.create(scope, record).await
    }

    /// Manifest for `platform` below `desc`, which may be an index
    async fn select_manifest(
        &self,
        scope: &Scope,
        desc: &Descriptor,
        platform: &Platform,
    ) -> Result<(Descriptor, ImageManifest)> {
        let data = self.client.images.read_blob(scope, &desc.digest).await?;
        if media_types::is_index(&desc.media_type) {
            let index: ImageIndex = serde_json::from_slice(&data)?;
            let chosen = select_platform(&index, platform)?;
            let data = self.client.images.read_blob(scope, &chosen.digest).await?;
            return Ok((chosen, serde_json::from_slice(&data)?));
        }
        Ok((desc.clone(), serde_json::from_slice(&data)?))
    }

    /// Load the manifest and config of an image for `platform`
    pub async fn read_image(&self, scope: &Scope, record: &ImageRecord, platform: &Platform) -> Result<Image> {
        let (manifest_desc, manifest) = self.select_manifest(scope, &record.target, platform).await?;
        let config = self.client.images.read_blob(scope, &manifest.config.digest).await?;
        Ok(Image {
            record: record.clone(),
            manifest_digest: manifest_desc.digest,
            manifest,
            config: serde_json::from_slice(&config)?,
        })
    }

    /// Pull `reference` for `platform` into the content store and create its record.
    ///
    /// Every blob is written under one lease with GC reference labels, so
    /// nothing is collected before the image record exists.
    pub async fn pull(
        &self,
        scope: &Scope,
        reference: &Reference,
        platform: &Platform,
        fetcher: &dyn Fetcher,
    ) -> Result<ImageRecord> {
        info!("pulling {} for {}", reference, platform);
        let failed = |e: RuneError| match e {
            RuneError::ImageNotFound(_) | RuneError::Canceled => e,
            other => RuneError::ImagePullFailed {
                reference: reference.to_string(),
                reason: other.to_string(),
            },
        };

        self.client
            .with_lease(scope, |scope| async move {
                let (top, top_data) = fetcher.resolve(reference).await.map_err(failed)?;

                let (manifest_desc, manifest_data, index) = if media_types::is_index(&top.media_type) {
                    let index: ImageIndex = serde_json::from_slice(&top_data)?;
                    let chosen = select_platform(&index, platform)?;
                    let data = fetcher.fetch(reference, &chosen).await.map_err(failed)?;
                    (chosen, data, Some(index))
                } else {
                    (top.clone(), top_data.clone(), None)
                };
                let manifest: ImageManifest = serde_json::from_slice(&manifest_data)?;

                for desc in std::iter::once(&manifest.config).chain(manifest.layers.iter()) {
                    if self.client.images.blob_exists(&scope, &desc.digest).await? {
                        debug!("blob {} already present", desc.digest);
                        continue;
                    }
                    let data = fetcher.fetch(reference, desc).await.map_err(failed)?;
                    self.client
                        .images
                        .write_blob(&scope, desc, data, HashMap::new())
                        .await?;
                }

                self.client
                    .images
                    .write_blob(&scope, &manifest_desc, manifest_data, manifest_gc_labels(&manifest))
                    .await?;

                if let Some(index) = index {
                    let mut labels = HashMap::new();
                    for (i, m) in index.manifests.iter().enumerate() {
                        if m.digest == manifest_desc.digest {
                            labels.insert(format!("containerd.io/gc.ref.content.m.{}", i), m.digest.clone());
                        }
                    }
                    self.client.images.write_blob(&scope, &top, top_data, labels).await?;
                }

                self.client
                    .images
                    .create(&scope, ImageRecord::new(&reference.to_string(), top))
                    .await
            })
            .await
    }

    /// Whether the top chain of `image` is committed on the snapshotter
    pub async fn is_unpacked(&self, scope: &Scope, image: &Image) -> Result<bool> {
        match image.chain_id() {
            Some(chain) => self.client.snapshots.exists(scope, &self.snapshotter, &chain).await,
            None => Ok(true),
        }
    }

    /// Apply every layer of `image` onto the snapshotter, keyed by chain id.
    ///
    /// Layers already committed are skipped. Returns the top chain id.
    pub async fn unpack(&self, scope: &Scope, image: &Image) -> Result<String> {
        let diff_ids = &image.config.rootfs.diff_ids;
        if diff_ids.len() != image.manifest.layers.len() {
            return Err(RuneError::InvalidConfig(format!(
                "image has {} layers but {} diff ids",
                image.manifest.layers.len(),
                diff_ids.len()
            )));
        }
        let chains = chain_ids(diff_ids);
        let snapshotter = self.snapshotter.clone();

        let top = self
            .client
            .with_lease(scope, |scope| async move {
                let mut parent = String::new();
                for (i, chain) in chains.iter().enumerate() {
                    if self.client.snapshots.exists(&scope, &snapshotter, chain).await? {
                        parent = chain.clone();
                        continue;
                    }
                    self.apply(&scope, &snapshotter, &image.manifest.layers[i], &diff_ids[i], chain, &parent)
                        .await?;
                    parent = chain.clone();
                }
                Ok(parent)
            })
            .await?;

        if !top.is_empty() {
            let mut labels = HashMap::new();
            labels.insert(format!("{}{}", LABEL_GC_SNAPSHOT_PREFIX, self.snapshotter), top.clone());
            self.client
                .images
                .label_blob(scope, &image.manifest.config.digest, labels)
                .await?;
        }
        info!("unpacked {} onto {} ({})", image.record.name, self.snapshotter, top);
        Ok(top)
    }

    async fn apply(
        &self,
        scope: &Scope,
        snapshotter: &str,
        layer: &Descriptor,
        diff_id: &str,
        chain: &str,
        parent: &str,
    ) -> Result<()> {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let key = format!("extract-{}-{}", nanos, chain);
        let mounts = self.client.snapshots.prepare(scope, snapshotter, &key, parent).await?;

        let applied = async {
            let diff = self.client.images.apply_layer(scope, layer, &mounts).await?;
            if diff != diff_id {
                return Err(RuneError::InvalidConfig(format!(
                    "wrong diff id {} for layer {}, expected {}",
                    diff, layer.digest, diff_id
                )));
            }
            self.client.snapshots.commit(scope, snapshotter, chain, &key).await
        }
        .await;

        match applied {
            Ok(()) => Ok(()),
            Err(RuneError::AlreadyExists(_)) => {
                // Another unpack committed the same chain first.
                self.remove_key(snapshotter, scope, &key).await;
                Ok(())
            }
            Err(e) => {
                self.remove_key(snapshotter, scope, &key).await;
                Err(e)
            }
        }
    }

    async fn remove_key(&self, snapshotter: &str, scope: &Scope, key: &str) {
        let cleanup = Scope::new(scope.namespace());
        let cleanup = match scope.lease() {
            Some(lease) => cleanup.with_lease(lease),
            None => cleanup,
        };
        if let Err(e) = self.client.snapshots.remove(&cleanup, snapshotter, key).await {
            if !e.is_not_found() {
                warn!("failed to remove extraction snapshot {}: {}", key, e);
            }
        }
    }

    /// Upload the content of `record` for `platform` as `target`
    pub async fn push(
        &self,
        scope: &Scope,
        record: &ImageRecord,
        target: &Reference,
        platform: &Platform,
        pusher: &dyn Pusher,
    ) -> Result<String> {
        let (manifest_desc, manifest) = self.select_manifest(scope, &record.target, platform).await?;
        for desc in manifest.layers.iter().chain(std::iter::once(&manifest.config)) {
            let data = self.client.images.read_blob(scope, &desc.digest).await?;
            pusher.push_blob(target, desc, data).await?;
        }
        let data = self.client.images.read_blob(scope, &manifest_desc.digest).await?;
        pusher.push_manifest(target, &manifest_desc, data).await?;
        info!("pushed {} as {}", record.name, target);
        Ok(manifest_desc.digest)
    }
}

/// GC labels that keep a manifest's config and layers alive
pub fn manifest_gc_labels(manifest: &ImageManifest) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    labels.insert(LABEL_GC_CONFIG.to_string(), manifest.config.digest.clone());
    for (i, layer) in manifest.layers.iter().enumerate() {
        labels.insert(format!("containerd.io/gc.ref.content.l.{}", i), layer.digest.clone());
    }
    labels
}

/// Pick the index entry that runs on `platform`
pub fn select_platform(index: &ImageIndex, platform: &Platform) -> Result<Descriptor> {
    index
        .manifests
        .iter()
        .filter(|m| media_types::is_manifest(&m.media_type) || m.media_type.is_empty())
        .find(|m| m.platform.as_ref().map(|p| platform.matches(p)).unwrap_or(false))
        .cloned()
        .ok_or_else(|| RuneError::ImageNotFound(format!("no manifest for platform {}", platform)))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::daemon::fake::FakeBackend;
    use crate::image::oci::sha256_digest;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::io::Write;

    /// Registry serving blobs from memory
    #[derive(Default)]
    pub struct MemoryRegistry {
        pub tops: HashMap<String, Descriptor>,
        pub blobs: HashMap<String, Vec<u8>>,
        pub fetched: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Fetcher for MemoryRegistry {
        async fn resolve(&self, reference: &Reference) -> Result<(Descriptor, Vec<u8>)> {
            let desc = self
                .tops
                .get(&reference.to_string())
                .cloned()
                .ok_or_else(|| RuneError::ImageNotFound(reference.to_string()))?;
            Ok((desc.clone(), self.blobs[&desc.digest].clone()))
        }

        async fn fetch(&self, _reference: &Reference, desc: &Descriptor) -> Result<Vec<u8>> {
            self.fetched.lock().unwrap().push(desc.digest.clone());
            self.blobs
                .get(&desc.digest)
                .cloned()
                .ok_or_else(|| RuneError::Registry(format!("blob unknown: {}", desc.digest)))
        }
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    impl MemoryRegistry {
        /// Publish a two-layer image, optionally behind an index
        pub fn publish(&mut self, name: &str, config: crate::image::oci::ContainerConfig, with_index: bool) {
            let plain: Vec<Vec<u8>> = vec![format!("{}-base", name).into_bytes(), format!("{}-app", name).into_bytes()];
            let mut layers = Vec::new();
            let mut diff_ids = Vec::new();
            for p in &plain {
                let gz = gzip(p);
                let desc = Descriptor::for_blob(media_types::OCI_LAYER_GZIP, &gz);
                self.blobs.insert(desc.digest.clone(), gz);
                diff_ids.push(sha256_digest(p));
                layers.push(desc);
            }
            let config_file = ImageConfigFile {
                architecture: Platform::host().architecture,
                os: "linux".to_string(),
                created: None,
                config,
                rootfs: crate::image::oci::RootFs {
                    typ: "layers".to_string(),
                    diff_ids,
                },
            };
            let config_data = serde_json::to_vec(&config_file).unwrap();
            let config_desc = Descriptor::for_blob(media_types::OCI_CONFIG, &config_data);
            self.blobs.insert(config_desc.digest.clone(), config_data);
            let manifest = ImageManifest {
                schema_version: 2,
                media_type: media_types::OCI_MANIFEST.to_string(),
                config: config_desc,
                layers,
                annotations: BTreeMap::new(),
            };
            let manifest_data = serde_json::to_vec(&manifest).unwrap();
            let mut manifest_desc = Descriptor::for_blob(media_types::OCI_MANIFEST, &manifest_data);
            self.blobs.insert(manifest_desc.digest.clone(), manifest_data);

            let top = if with_index {
                manifest_desc.platform = Some(Platform::host());
                let other = Descriptor {
                    media_type: media_types::OCI_MANIFEST.to_string(),
                    digest: sha256_digest(b"other-platform"),
                    size: 14,
                    platform: Some(Platform { architecture: "s390x".into(), os: "linux".into(), variant: None }),
                    annotations: BTreeMap::new(),
                };
                let index = ImageIndex {
                    schema_version: 2,
                    media_type: media_types::OCI_INDEX.to_string(),
                    manifests: vec![other, manifest_desc],
                    annotations: BTreeMap::new(),
                };
                let data = serde_json::to_vec(&index).unwrap();
                let desc = Descriptor::for_blob(media_types::OCI_INDEX, &data);
                self.blobs.insert(desc.digest.clone(), data);
                desc
            } else {
                manifest_desc
            };
            let reference = Reference::parse(name).unwrap();
            self.tops.insert(reference.to_string(), top);
        }
    }

    fn store() -> (FakeBackend, ImageStore, Scope) {
        let fake = FakeBackend::default();
        let store = ImageStore::new(Client::from_backend(fake.clone()), "overlayfs");
        (fake, store, Scope::new("default"))
    }

    #[tokio::test]
    async fn test_pull_index_selects_host_platform_and_labels_blobs() {
        let (fake, store, scope) = store();
        let mut registry = MemoryRegistry::default();
        registry.publish("alpine", Default::default(), true);
        let reference = Reference::parse("alpine").unwrap();

        let record = store.pull(&scope, &reference, &Platform::host(), &registry).await.unwrap();
        assert_eq!(record.name, "docker.io/library/alpine:latest");
        assert!(media_types::is_index(&record.target.media_type));
        assert!(fake.active_leases().is_empty());

        let image = store.read_image(&scope, &record, &Platform::host()).await.unwrap();
        assert_eq!(image.manifest.layers.len(), 2);
        let labels = fake.blob_labels(&image.manifest_digest);
        assert_eq!(labels[LABEL_GC_CONFIG], image.manifest.config.digest);
        assert_eq!(labels["containerd.io/gc.ref.content.l.1"], image.manifest.layers[1].digest);
        let index_labels = fake.blob_labels(&record.target.digest);
        assert_eq!(index_labels["containerd.io/gc.ref.content.m.1"], image.manifest_digest);
    }

    #[tokio::test]
    async fn test_pull_skips_blobs_already_present() {
        let (_fake, store, scope) = store();
        let mut registry = MemoryRegistry::default();
        registry.publish("alpine", Default::default(), false);
        let reference = Reference::parse("alpine").unwrap();
        store.pull(&scope, &reference, &Platform::host(), &registry).await.unwrap();
        let first = registry.fetched.lock().unwrap().len();
        assert_eq!(first, 3);
        store.pull(&scope, &reference, &Platform::host(), &registry).await.unwrap();
        assert_eq!(registry.fetched.lock().unwrap().len(), first);
    }

    #[tokio::test]
    async fn test_pull_wraps_registry_failures() {
        let (_fake, store, scope) = store();
        let mut registry = MemoryRegistry::default();
        registry.publish("alpine", Default::default(), false);
        registry.blobs.retain(|_, v| !v.starts_with(b"{\"architecture"));
        let err = store
            .pull(&scope, &Reference::parse("alpine").unwrap(), &Platform::host(), &registry)
            .await
            .unwrap_err();
        assert!(matches!(err, RuneError::ImagePullFailed { .. }));

        let err = store
            .pull(&scope, &Reference::parse("missing").unwrap(), &Platform::host(), &registry)
            .await
            .unwrap_err();
        assert!(matches!(err, RuneError::ImageNotFound(_)));
    }

    #[tokio::test]
    async fn test_unpack_commits_chain_and_is_idempotent() {
        let (fake, store, scope) = store();
        let mut registry = MemoryRegistry::default();
        registry.publish("alpine", Default::default(), false);
        let reference = Reference::parse("alpine").unwrap();
        let record = store.pull(&scope, &reference, &Platform::host(), &registry).await.unwrap();
        let image = store.read_image(&scope, &record, &Platform::host()).await.unwrap();

        assert!(!store.is_unpacked(&scope, &image).await.unwrap());
        let top = store.unpack(&scope, &image).await.unwrap();
        assert_eq!(Some(top.clone()), image.chain_id());
        assert!(store.is_unpacked(&scope, &image).await.unwrap());

        let chains = chain_ids(&image.config.rootfs.diff_ids);
        assert_eq!(fake.snapshot(&chains[1]).unwrap().parent, chains[0]);
        assert!(fake.snapshot_keys().iter().all(|k| !k.starts_with("extract-")));
        assert_eq!(
            fake.blob_labels(image.id())["containerd.io/gc.ref.snapshot.overlayfs"],
            top
        );

        let again = store.unpack(&scope, &image).await.unwrap();
        assert_eq!(again, top);
    }

    #[tokio::test]
    async fn test_resolve_by_id_prefix_and_tag() {
        let (_fake, store, scope) = store();
        let mut registry = MemoryRegistry::default();
        registry.publish("alpine", Default::default(), false);
        let record = store
            .pull(&scope, &Reference::parse("alpine").unwrap(), &Platform::host(), &registry)
            .await
            .unwrap();
        let image = store.read_image(&scope, &record, &Platform::host()).await.unwrap();

        let found = store.resolve(&scope, &crate::image::oci::digest_hex(image.id())[..12]).await.unwrap();
        assert_eq!(found.map(|r| r.name), Some(record.name.clone()));

        let target = Reference::parse("mine:v1").unwrap();
        store.tag(&scope, &record, &target).await.unwrap();
        let tagged = store.resolve(&scope, "mine:v1").await.unwrap().unwrap();
        assert_eq!(tagged.target.digest, record.target.digest);
        assert!(store.resolve(&scope, "nothing").await.unwrap().is_none());
    }
}
