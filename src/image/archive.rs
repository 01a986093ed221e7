//! Image archives: `save` and `load`
//!
//! Archives carry the OCI image layout (`oci-layout`, `index.json`,
//! `blobs/sha256/*`) and a Docker `manifest.json` side by side, so either
//! kind of consumer can read them.

use super::oci::{
    digest_hex, media_types, sha256_digest, Descriptor, ImageIndex, ImageManifest, Platform,
};
use super::reference::Reference;
use super::store::{manifest_gc_labels, ImageStore};
use crate::daemon::{ImageRecord, Scope};
use crate::error::{Result, RuneError};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use tracing::{info, warn};

const ANNOTATION_IMAGE_NAME: &str = "io.containerd.image.name";
const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

/// One entry of a Docker `manifest.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DockerManifestEntry {
    config: String,
    #[serde(default)]
    repo_tags: Vec<String>,
    layers: Vec<String>,
}

fn blob_path(digest: &str) -> String {
    format!("blobs/sha256/{}", digest_hex(digest))
}

fn append<W: Write>(builder: &mut tar::Builder<W>, path: &str, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_entry_type(tar::EntryType::Regular);
    builder.append_data(&mut header, path, data)?;
    Ok(())
}

/// Write `images` to `out` as a dual-format archive
pub async fn save<W: Write>(
    store: &ImageStore,
    scope: &Scope,
    images: &[ImageRecord],
    platform: &Platform,
    out: W,
) -> Result<()> {
    let images_api = &store.client().images;
    let mut blobs: BTreeMap<String, Vec<u8>> = BTreeMap::new();
    let mut index = ImageIndex {
        schema_version: 2,
        media_type: media_types::OCI_INDEX.to_string(),
        ..ImageIndex::default()
    };
    let mut docker: Vec<DockerManifestEntry> = Vec::new();

    for record in images {
        let image = store.read_image(scope, record, platform).await?;
        let manifest_data = images_api.read_blob(scope, &image.manifest_digest).await?;
        let mut desc = Descriptor::for_blob(
            if image.manifest.media_type.is_empty() {
                media_types::OCI_MANIFEST
            } else {
                &image.manifest.media_type
            },
            &manifest_data,
        );
        blobs.insert(desc.digest.clone(), manifest_data);
        for layer in std::iter::once(&image.manifest.config).chain(image.manifest.layers.iter()) {
            if !blobs.contains_key(&layer.digest) {
                let data = images_api.read_blob(scope, &layer.digest).await?;
                blobs.insert(layer.digest.clone(), data);
            }
        }

        let reference = Reference::parse(&record.name)?;
        desc.annotations
            .insert(ANNOTATION_IMAGE_NAME.to_string(), record.name.clone());
        if let Some(tag) = &reference.tag {
            desc.annotations.insert(ANNOTATION_REF_NAME.to_string(), tag.clone());
        }
        index.manifests.push(desc);

        docker.push(DockerManifestEntry {
            config: blob_path(&image.manifest.config.digest),
            repo_tags: reference.tag.as_ref().map(|_| vec![reference.familiar()]).unwrap_or_default(),
            layers: image.manifest.layers.iter().map(|l| blob_path(&l.digest)).collect(),
        });
    }

    let mut builder = tar::Builder::new(out);
    append(&mut builder, "oci-layout", br#"{"imageLayoutVersion":"1.0.0"}"#)?;
    for (digest, data) in &blobs {
        append(&mut builder, &blob_path(digest), data)?;
    }
    append(&mut builder, "index.json", &serde_json::to_vec(&index)?)?;
    append(&mut builder, "manifest.json", &serde_json::to_vec(&docker)?)?;
    builder.into_inner()?.flush()?;
    info!("saved {} image(s)", images.len());
    Ok(())
}

/// Read every regular file of a (possibly gzipped) tarball into memory
fn read_entries(data: &[u8]) -> Result<HashMap<String, Vec<u8>>> {
    let plain;
    let data = if data.starts_with(&[0x1f, 0x8b]) {
        let mut buf = Vec::new();
        GzDecoder::new(data).read_to_end(&mut buf)?;
        plain = buf;
        &plain[..]
    } else {
        data
    };
    let mut entries = HashMap::new();
    let mut archive = tar::Archive::new(data);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path()?.to_string_lossy().trim_start_matches("./").to_string();
        let mut buf = Vec::new();
        entry.read_to_end(&mut buf)?;
        entries.insert(path, buf);
    }
    Ok(entries)
}

/// Name an OCI index entry should be imported under
fn oci_entry_name(desc: &Descriptor) -> Option<String> {
    if let Some(name) = desc.annotations.get(ANNOTATION_IMAGE_NAME) {
        return Some(name.clone());
    }
    let ref_name = desc.annotations.get(ANNOTATION_REF_NAME)?;
    Reference::parse(ref_name)
        .ok()
        .filter(|_| ref_name.contains('/') || ref_name.contains(':'))
        .map(|r| r.to_string())
}

/// Import an archive; returns the created image records
pub async fn load(store: &ImageStore, scope: &Scope, data: &[u8], platform: &Platform) -> Result<Vec<ImageRecord>> {
    let entries = read_entries(data)?;
    let blob = |path: &str| -> Result<Vec<u8>> {
        entries
            .get(path)
            .cloned()
            .ok_or_else(|| RuneError::InvalidConfig(format!("archive is missing {}", path)))
    };

    // (name, top descriptor, manifest documents to write)
    let mut imports: Vec<(String, Descriptor, Vec<(Descriptor, ImageManifest, Vec<u8>)>)> = Vec::new();

    if let Some(raw) = entries.get("index.json") {
        let index: ImageIndex = serde_json::from_slice(raw)?;
        for desc in &index.manifests {
            let Some(name) = oci_entry_name(desc) else {
                warn!("skipping unnamed manifest {}", desc.digest);
                continue;
            };
            let mut docs = Vec::new();
            let top_data = blob(&blob_path(&desc.digest))?;
            if media_types::is_index(&desc.media_type) {
                let nested: ImageIndex = serde_json::from_slice(&top_data)?;
                for m in nested.manifests.iter().filter(|m| entries.contains_key(&blob_path(&m.digest))) {
                    let data = blob(&blob_path(&m.digest))?;
                    docs.push((m.clone(), serde_json::from_slice(&data)?, data));
                }
            } else {
                docs.push((desc.clone(), serde_json::from_slice(&top_data)?, top_data));
            }
            let mut top = desc.clone();
            top.annotations.clear();
            imports.push((name, top, docs));
        }
    } else if let Some(raw) = entries.get("manifest.json") {
        let docker: Vec<DockerManifestEntry> = serde_json::from_slice(raw)?;
        for entry in docker {
            let config = blob(&entry.config)?;
            let mut layers = Vec::new();
            for path in &entry.layers {
                let data = blob(path)?;
                let media_type = if data.starts_with(&[0x1f, 0x8b]) {
                    media_types::DOCKER_LAYER
                } else {
                    "application/vnd.docker.image.rootfs.diff.tar"
                };
                layers.push(Descriptor::for_blob(media_type, &data));
            }
            let manifest = ImageManifest {
                schema_version: 2,
                media_type: media_types::MANIFEST_V2.to_string(),
                config: Descriptor::for_blob(media_types::DOCKER_CONFIG, &config),
                layers,
                annotations: BTreeMap::new(),
            };
            let manifest_data = serde_json::to_vec(&manifest)?;
            let desc = Descriptor::for_blob(media_types::MANIFEST_V2, &manifest_data);
            if entry.repo_tags.is_empty() {
                warn!("skipping untagged image with config {}", manifest.config.digest);
            }
            for tag in &entry.repo_tags {
                let name = Reference::parse(tag)?.to_string();
                imports.push((name, desc.clone(), vec![(desc.clone(), manifest.clone(), manifest_data.clone())]));
            }
        }
    } else {
        return Err(RuneError::InvalidConfig(
            "archive has neither index.json nor manifest.json".to_string(),
        ));
    }

    // Docker archives store blobs by path, OCI ones by digest.
    let by_digest: HashMap<String, &Vec<u8>> = entries.values().map(|d| (sha256_digest(d), d)).collect();

    let images = &store.client().images;
    let records = store
        .client()
        .with_lease(scope, |scope| async move {
            let mut records = Vec::new();
            for (name, top, docs) in &imports {
                for (desc, manifest, data) in docs {
                    for part in std::iter::once(&manifest.config).chain(manifest.layers.iter()) {
                        let content = by_digest.get(&part.digest).ok_or_else(|| {
                            RuneError::InvalidConfig(format!("archive is missing blob {}", part.digest))
                        })?;
                        images
                            .write_blob(&scope, part, (*content).clone(), HashMap::new())
                            .await?;
                    }
                    images
                        .write_blob(&scope, desc, data.clone(), manifest_gc_labels(manifest))
                        .await?;
                }
                if media_types::is_index(&top.media_type) {
                    let data = by_digest
                        .get(&top.digest)
                        .ok_or_else(|| RuneError::InvalidConfig(format!("archive is missing blob {}", top.digest)))?;
                    let labels = docs
                        .iter()
                        .enumerate()
                        .map(|(i, (d, _, _))| (format!("containerd.io/gc.ref.content.m.{}", i), d.digest.clone()))
                        .collect();
                    images.write_blob(&scope, top, (*data).clone(), labels).await?;
                }
                let record = images.create(&scope, ImageRecord::new(name, top.clone())).await?;
                info!("loaded {}", record.name);
                records.push(record);
            }
            Ok(records)
        })
        .await?;

    for record in &records {
        match store.read_image(scope, record, platform).await {
            Ok(image) => {
                store.unpack(scope, &image).await?;
            }
            Err(e) => warn!("not unpacking {} for {}: {}", record.name, platform, e),
        }
    }
    Ok(records)
}
