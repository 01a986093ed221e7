//! Image commands

use super::{for_each_target, print_documents, Context};
use crate::container::format::{human_duration, render_rows_titled};
use crate::daemon::{ImageRecord, Scope};
use crate::error::{Result, RuneError};
use crate::image::oci::digest_hex;
use crate::image::verify::verifier;
use crate::image::{archive, ensure_image, EnsureOptions, ImageStore, Platform, PullPolicy, Reference, VerifyMode};
use chrono::{DateTime, Utc};
use clap::Args;
use serde::Serialize;
use serde_json::{json, Value};
use std::io::{IsTerminal, Read, Write};
use std::path::PathBuf;
use tracing::warn;

#[derive(Args, Debug)]
pub struct PullArgs {
    /// Pull content for a specific platform
    #[arg(long)]
    pub platform: Option<String>,
    /// Verify the image (none or cosign)
    #[arg(long, default_value = "none")]
    pub verify: String,
    /// Path to the public key file for cosign verification
    #[arg(long)]
    pub cosign_key: Option<PathBuf>,
    /// Suppress verbose output
    #[arg(short, long)]
    pub quiet: bool,
    pub image: String,
}

#[derive(Args, Debug)]
pub struct PushArgs {
    /// Push content for a specific platform
    #[arg(long)]
    pub platform: Option<String>,
    pub image: String,
}

#[derive(Args, Debug)]
pub struct LoadArgs {
    /// Read from tar archive file, instead of STDIN
    #[arg(short, long)]
    pub input: Option<PathBuf>,
    /// Unpack content for a specific platform
    #[arg(long)]
    pub platform: Option<String>,
    /// Suppress the load output
    #[arg(short, long)]
    pub quiet: bool,
}

#[derive(Args, Debug)]
pub struct SaveArgs {
    /// Write to a file, instead of STDOUT
    #[arg(short, long)]
    pub output: Option<PathBuf>,
    /// Export content for a specific platform
    #[arg(long)]
    pub platform: Option<String>,
    #[arg(required = true)]
    pub images: Vec<String>,
}

#[derive(Args, Debug)]
pub struct TagArgs {
    pub source: String,
    pub target: String,
}

#[derive(Args, Debug)]
pub struct RmiArgs {
    /// Remove the image even when containers use it
    #[arg(short, long)]
    pub force: bool,
    #[arg(required = true)]
    pub images: Vec<String>,
}

#[derive(Args, Debug)]
pub struct ImagesArgs {
    /// Only show image IDs
    #[arg(short, long)]
    pub quiet: bool,
    /// Don't truncate output
    #[arg(long)]
    pub no_trunc: bool,
    /// Format the output using a template
    #[arg(long)]
    pub format: Option<String>,
}

fn platform(raw: Option<&str>) -> Result<Platform> {
    match raw {
        None => Ok(Platform::host()),
        Some(s) => Platform::parse(s).ok_or_else(|| RuneError::usage(format!("invalid platform {:?}", s))),
    }
}

async fn resolve(store: &ImageStore, scope: &Scope, raw: &str) -> Result<ImageRecord> {
    store
        .resolve(scope, raw)
        .await?
        .ok_or_else(|| RuneError::ImageNotFound(raw.to_string()))
}

/// `(repository, tag)` in the short Docker spelling
fn repo_tag(name: &str) -> (String, String) {
    match Reference::parse(name) {
        Ok(r) => {
            let tag = r.tag.clone().unwrap_or_else(|| "<none>".to_string());
            let bare = Reference {
                tag: None,
                digest: None,
                ..r
            };
            (bare.familiar(), tag)
        }
        Err(_) => (name.to_string(), "<none>".to_string()),
    }
}

/// Docker's decimal size with four significant digits, e.g. `7.796MB`
pub fn human_size(bytes: i64) -> String {
    const UNITS: [&str; 6] = ["B", "kB", "MB", "GB", "TB", "PB"];
    let mut value = bytes.max(0) as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit + 1 < UNITS.len() {
        value /= 1000.0;
        unit += 1;
    }
    let int_digits = if value < 1.0 { 1 } else { value.log10().floor() as usize + 1 };
    let decimals = 4usize.saturating_sub(int_digits);
    let mut text = format!("{:.*}", decimals, value);
    if text.contains('.') {
        text = text.trim_end_matches('0').trim_end_matches('.').to_string();
    }
    format!("{}{}", text, UNITS[unit])
}

pub async fn pull(ctx: &Context, args: &PullArgs) -> Result<()> {
    ctx.cancel_on_interrupt();
    let mode: VerifyMode = args.verify.parse()?;
    let verify = verifier(mode, args.cosign_key.clone());
    let ensured = ensure_image(
        &ctx.images(),
        &ctx.scope,
        &args.image,
        &EnsureOptions {
            policy: PullPolicy::Always,
            platform: platform(args.platform.as_deref())?,
            fetcher: ctx.fetcher(),
            verifier: verify.as_deref(),
        },
    )
    .await?;
    if args.quiet {
        println!("{}", ensured.image.id());
    } else {
        println!("{}", ensured.reference);
    }
    Ok(())
}

pub async fn push(ctx: &Context, args: &PushArgs) -> Result<()> {
    ctx.cancel_on_interrupt();
    let store = ctx.images();
    let record = resolve(&store, &ctx.scope, &args.image).await?;
    let reference = Reference::parse(&record.name)?;
    let digest = store
        .push(&ctx.scope, &record, &reference, &platform(args.platform.as_deref())?, ctx.pusher())
        .await?;
    println!("{}: digest: {}", reference.object(), digest);
    Ok(())
}

pub async fn load(ctx: &Context, args: &LoadArgs) -> Result<()> {
    ctx.cancel_on_interrupt();
    let data = match &args.input {
        Some(path) => tokio::fs::read(path).await?,
        None => {
            let stdin = std::io::stdin();
            if stdin.is_terminal() {
                return Err(RuneError::usage("requested load from stdin, but stdin is a terminal"));
            }
            let mut buf = Vec::new();
            stdin.lock().read_to_end(&mut buf)?;
            buf
        }
    };
    let store = ctx.images();
    let records = archive::load(&store, &ctx.scope, &data, &platform(args.platform.as_deref())?).await?;
    if !args.quiet {
        for record in records {
            let name = Reference::parse(&record.name).map_or(record.name.clone(), |r| r.familiar());
            println!("Loaded image: {}", name);
        }
    }
    Ok(())
}

pub async fn save(ctx: &Context, args: &SaveArgs) -> Result<()> {
    ctx.cancel_on_interrupt();
    let store = ctx.images();
    let mut records = Vec::new();
    for raw in &args.images {
        records.push(resolve(&store, &ctx.scope, raw).await?);
    }
    let platform = platform(args.platform.as_deref())?;
    match &args.output {
        Some(path) => {
            let file = std::fs::File::create(path)?;
            archive::save(&store, &ctx.scope, &records, &platform, std::io::BufWriter::new(file)).await
        }
        None => {
            let stdout = std::io::stdout();
            if stdout.is_terminal() {
                return Err(RuneError::usage(
                    "cowardly refusing to save to a terminal, use the -o flag or redirect",
                ));
            }
            archive::save(&store, &ctx.scope, &records, &platform, stdout.lock()).await
        }
    }
}

pub async fn tag(ctx: &Context, args: &TagArgs) -> Result<()> {
    let store = ctx.images();
    let source = resolve(&store, &ctx.scope, &args.source).await?;
    let target = Reference::parse(&args.target)?;
    store.tag(&ctx.scope, &source, &target).await?;
    Ok(())
}

/// Delete one image record, refusing while a container uses it
async fn remove_one(ctx: &Context, store: &ImageStore, raw: &str, force: bool) -> Result<String> {
    let record = resolve(store, &ctx.scope, raw).await?;
    if !force {
        let containers = ctx.client.containers.list(&ctx.scope).await?;
        if let Some(user) = containers.iter().find(|c| c.image == record.name) {
            return Err(RuneError::ImageInUse {
                reference: raw.to_string(),
                container: user.id.chars().take(12).collect(),
            });
        }
    }
    store.delete(&ctx.scope, &record.name).await?;
    Ok(format!("Untagged: {}", record.name))
}

pub async fn remove(ctx: &Context, args: &RmiArgs) -> Result<()> {
    let store = &ctx.images();
    let force = args.force;
    for_each_target(&args.images, &mut std::io::stdout(), &mut std::io::stderr(), |raw| async move {
        remove_one(ctx, store, &raw, force).await
    })
    .await
}

/// One `images` row; field names are the `--format` placeholders
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageRow {
    pub repository: String,
    pub tag: String,
    #[serde(rename = "ID")]
    pub id: String,
    pub digest: String,
    pub created_at: String,
    pub created_since: String,
    pub size: String,
}

pub const IMAGES_TABLE: &str = "{{.Repository}}\t{{.Tag}}\t{{.ID}}\t{{.CreatedSince}}\t{{.Size}}";

async fn image_row(store: &ImageStore, scope: &Scope, record: &ImageRecord, no_trunc: bool, now: DateTime<Utc>) -> ImageRow {
    let (repository, tag) = repo_tag(&record.name);
    let (id, size, created) = match store.read_image(scope, record, &Platform::host()).await {
        Ok(image) => {
            let created = image
                .config
                .created
                .as_deref()
                .and_then(|c| DateTime::parse_from_rfc3339(c).ok())
                .map(|c| c.with_timezone(&Utc));
            (image.id().to_string(), image.size(), created.or(record.created_at))
        }
        Err(e) => {
            warn!("failed to read image {}: {}", record.name, e);
            (record.target.digest.clone(), record.target.size, record.created_at)
        }
    };
    ImageRow {
        repository,
        tag,
        id: if no_trunc { id } else { digest_hex(&id).chars().take(12).collect() },
        digest: record.target.digest.clone(),
        created_at: created.map(|c| c.to_rfc3339()).unwrap_or_default(),
        created_since: created.map_or_else(String::new, |c| format!("{} ago", human_duration(now - c))),
        size: human_size(size),
    }
}

pub async fn list(ctx: &Context, args: &ImagesArgs) -> Result<()> {
    let store = ctx.images();
    let now = Utc::now();
    let mut rows = Vec::new();
    for record in store.list(&ctx.scope).await? {
        rows.push(image_row(&store, &ctx.scope, &record, args.no_trunc, now).await);
    }
    let mut stdout = std::io::stdout().lock();
    if args.quiet {
        for row in &rows {
            writeln!(stdout, "{}", row.id)?;
        }
        return Ok(());
    }
    let rendered = render_rows_titled(&rows, args.format.as_deref(), IMAGES_TABLE, &[("ID", "IMAGE ID")])?;
    write!(stdout, "{}", rendered)?;
    Ok(())
}

/// Docker-shaped `inspect` document of one image
pub async fn inspect_document(store: &ImageStore, scope: &Scope, record: &ImageRecord) -> Result<Value> {
    let image = store.read_image(scope, record, &Platform::host()).await?;
    let (repository, _) = repo_tag(&record.name);
    let tags: Vec<String> = Reference::parse(&record.name)
        .ok()
        .filter(|r| r.tag.is_some())
        .map(|r| r.familiar())
        .into_iter()
        .collect();
    Ok(json!({
        "Id": image.id(),
        "RepoTags": tags,
        "RepoDigests": [format!("{}@{}", repository, record.target.digest)],
        "Created": image.config.created,
        "Architecture": image.config.architecture,
        "Os": image.config.os,
        "Size": image.size(),
        "Config": image.config.config,
        "RootFS": {
            "Type": image.config.rootfs.typ,
            "Layers": image.config.rootfs.diff_ids,
        },
        "Metadata": {
            "LastTagTime": record.updated_at,
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::tests::context;
    use crate::cli::{Cli, Commands};
    use clap::Parser;

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(0), "0B");
        assert_eq!(human_size(999), "999B");
        assert_eq!(human_size(7_795_580), "7.796MB");
        assert_eq!(human_size(187_000_000), "187MB");
        assert_eq!(human_size(1_500), "1.5kB");
    }

    #[test]
    fn test_repo_tag() {
        assert_eq!(repo_tag("docker.io/library/alpine:3.19"), ("alpine".to_string(), "3.19".to_string()));
        assert_eq!(
            repo_tag("ghcr.io/acme/tool:v1"),
            ("ghcr.io/acme/tool".to_string(), "v1".to_string())
        );
    }

    #[test]
    fn test_parse_save() {
        let cli = Cli::try_parse_from(["runectl", "save", "-o", "out.tar", "alpine", "nginx"]).unwrap();
        match cli.command {
            Commands::Save(args) => {
                assert_eq!(args.output, Some(PathBuf::from("out.tar")));
                assert_eq!(args.images, vec!["alpine", "nginx"]);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_tag_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let (_fake, ctx) = context(dir.path());
        let args = PullArgs {
            platform: None,
            verify: "none".into(),
            cosign_key: None,
            quiet: true,
            image: "alpine".into(),
        };
        pull(&ctx, &args).await.unwrap();

        tag(&ctx, &TagArgs { source: "alpine".into(), target: "mirror.local/alpine:pinned".into() })
            .await
            .unwrap();
        let store = ctx.images();
        let tagged = resolve(&store, &ctx.scope, "mirror.local/alpine:pinned").await.unwrap();
        let original = resolve(&store, &ctx.scope, "alpine").await.unwrap();
        assert_eq!(tagged.target, original.target);

        let doc = inspect_document(&store, &ctx.scope, &tagged).await.unwrap();
        assert_eq!(doc["RepoTags"][0], "mirror.local/alpine:pinned");

        remove(&ctx, &RmiArgs { force: false, images: vec!["mirror.local/alpine:pinned".into()] })
            .await
            .unwrap();
        assert!(store.resolve(&ctx.scope, "mirror.local/alpine:pinned").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rmi_refuses_image_in_use() {
        let dir = tempfile::tempdir().unwrap();
        let (_fake, ctx) = context(dir.path());
        let mut opts = crate::container::CreateOptions::new("alpine");
        opts.network = crate::network::NetworkMode::None;
        ctx.containers().create(&opts).await.unwrap();

        let store = ctx.images();
        let err = remove_one(&ctx, &store, "alpine", false).await.unwrap_err();
        assert!(matches!(err, RuneError::ImageInUse { .. }));
        remove_one(&ctx, &store, "alpine", true).await.unwrap();
    }
}
