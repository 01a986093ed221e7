//! containerd gRPC backend

use super::{
    ContainerRecord, ContainerService, ImageRecord, ImageService, LeaseManager, Mount, Scope,
    Snapshotter, TaskInfo, TaskIo, TaskService, TaskStatus,
};
use crate::error::{Result, RuneError};
use crate::image::oci::Descriptor;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use containerd_client::services::v1::container::Runtime;
use containerd_client::services::v1::containers_client::ContainersClient;
use containerd_client::services::v1::content_client::ContentClient;
use containerd_client::services::v1::diff_client::DiffClient;
use containerd_client::services::v1::images_client::ImagesClient;
use containerd_client::services::v1::leases_client::LeasesClient;
use containerd_client::services::v1::snapshots::snapshots_client::SnapshotsClient;
use containerd_client::services::v1::snapshots::{
    CommitSnapshotRequest, MountsRequest, PrepareSnapshotRequest, RemoveSnapshotRequest,
    StatSnapshotRequest, ViewSnapshotRequest,
};
use containerd_client::services::v1::tasks_client::TasksClient;
use containerd_client::services::v1::{
    ApplyRequest, Container, CreateContainerRequest, CreateImageRequest, CreateTaskRequest,
    DeleteContainerRequest, DeleteImageRequest, DeleteProcessRequest, DeleteTaskRequest,
    ExecProcessRequest, GetContainerRequest, GetImageRequest, GetRequest, Image, Info, InfoRequest,
    KillRequest, ListContainersRequest, ListImagesRequest, PauseTaskRequest, ReadContentRequest,
    ResizePtyRequest, ResumeTaskRequest, StartRequest, UpdateContainerRequest, UpdateImageRequest,
    UpdateRequest, WaitRequest, WriteAction, WriteContentRequest,
};
use containerd_client::tonic::transport::Channel;
use containerd_client::tonic::{Code, Request, Status};
use containerd_client::types::v1::Status as ProcStatus;
use containerd_client::types::{Descriptor as PbDescriptor, Mount as PbMount};
use prost_types::{Any, FieldMask, Timestamp};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

const SPEC_TYPE_URL: &str = "types.containerd.io/opencontainers/runtime-spec/1/Spec";
const PROCESS_TYPE_URL: &str = "types.containerd.io/opencontainers/runtime-spec/1/Process";
const WRITE_CHUNK: usize = 1 << 20;

fn rpc_err(status: Status) -> RuneError {
    match status.code() {
        Code::NotFound => RuneError::NotFound(status.message().to_string()),
        Code::AlreadyExists => RuneError::AlreadyExists(status.message().to_string()),
        Code::Cancelled => RuneError::Canceled,
        _ => RuneError::Rpc(format!("{:?}: {}", status.code(), status.message())),
    }
}

fn to_time(ts: Option<Timestamp>) -> Option<DateTime<Utc>> {
    ts.and_then(|t| DateTime::from_timestamp(t.seconds, t.nanos.max(0) as u32))
}

fn to_pb_descriptor(desc: &Descriptor) -> PbDescriptor {
    PbDescriptor {
        media_type: desc.media_type.clone(),
        digest: desc.digest.clone(),
        size: desc.size,
        annotations: desc.annotations.clone().into_iter().collect(),
    }
}

fn from_pb_descriptor(desc: PbDescriptor) -> Descriptor {
    Descriptor {
        media_type: desc.media_type,
        digest: desc.digest,
        size: desc.size,
        platform: None,
        annotations: desc.annotations.into_iter().collect(),
    }
}

fn to_pb_mounts(mounts: &[Mount]) -> Vec<PbMount> {
    mounts
        .iter()
        .map(|m| PbMount {
            r#type: m.typ.clone(),
            source: m.source.clone(),
            target: m.target.clone(),
            options: m.options.clone(),
            ..Default::default()
        })
        .collect()
}

fn from_pb_mounts(mounts: Vec<PbMount>) -> Vec<Mount> {
    mounts
        .into_iter()
        .map(|m| Mount {
            typ: m.r#type,
            source: m.source,
            target: m.target,
            options: m.options,
        })
        .collect()
}

fn from_pb_image(image: Image) -> ImageRecord {
    ImageRecord {
        name: image.name,
        target: image.target.map(from_pb_descriptor).unwrap_or_default(),
        labels: image.labels,
        created_at: to_time(image.created_at),
        updated_at: to_time(image.updated_at),
    }
}

fn to_pb_image(image: &ImageRecord) -> Image {
    Image {
        name: image.name.clone(),
        labels: image.labels.clone(),
        target: Some(to_pb_descriptor(&image.target)),
        ..Default::default()
    }
}

fn from_pb_container(c: Container) -> ContainerRecord {
    ContainerRecord {
        id: c.id,
        image: c.image,
        labels: c.labels,
        runtime: c.runtime.map(|r| r.name).unwrap_or_default(),
        spec: c.spec.and_then(|any| serde_json::from_slice(&any.value).ok()),
        snapshotter: c.snapshotter,
        snapshot_key: c.snapshot_key,
        created_at: to_time(c.created_at),
    }
}

fn task_status(code: i32) -> TaskStatus {
    match code {
        c if c == ProcStatus::Created as i32 => TaskStatus::Created,
        c if c == ProcStatus::Running as i32 => TaskStatus::Running,
        c if c == ProcStatus::Stopped as i32 => TaskStatus::Stopped,
        c if c == ProcStatus::Paused as i32 => TaskStatus::Paused,
        c if c == ProcStatus::Pausing as i32 => TaskStatus::Pausing,
        _ => TaskStatus::Unknown,
    }
}

/// Backend speaking the containerd v1 API over its unix socket
#[derive(Clone)]
pub struct ContainerdBackend {
    channel: Channel,
}

impl ContainerdBackend {
    pub async fn connect(path: &str) -> Result<Self> {
        let channel = containerd_client::connect(path)
            .await
            .map_err(|e| RuneError::UnreachableDaemon {
                address: path.to_string(),
                reason: e.to_string(),
            })?;
        debug!("connected to containerd at {}", path);
        Ok(Self { channel })
    }

    /// Wrap a message with the namespace and lease headers of `scope`
    fn request<T>(&self, scope: &Scope, msg: T) -> Request<T> {
        let mut req = Request::new(msg);
        let md = req.metadata_mut();
        if let Ok(ns) = scope.namespace().parse() {
            md.insert("containerd-namespace", ns);
        }
        if let Some(lease) = scope.lease() {
            if let Ok(value) = lease.parse() {
                md.insert("containerd-lease", value);
            }
        }
        req
    }
}

#[async_trait]
impl ImageService for ContainerdBackend {
    async fn get(&self, scope: &Scope, name: &str) -> Result<Option<ImageRecord>> {
        let mut client = ImagesClient::new(self.channel.clone());
        let req = self.request(scope, GetImageRequest { name: name.to_string(), ..Default::default() });
        match scope.run(async { client.get(req).await.map_err(rpc_err) }).await {
            Ok(resp) => Ok(resp.into_inner().image.map(from_pb_image)),
            Err(RuneError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list(&self, scope: &Scope) -> Result<Vec<ImageRecord>> {
        let mut client = ImagesClient::new(self.channel.clone());
        let req = self.request(scope, ListImagesRequest::default());
        let resp = scope.run(async { client.list(req).await.map_err(rpc_err) }).await?;
        Ok(resp.into_inner().images.into_iter().map(from_pb_image).collect())
    }

    async fn create(&self, scope: &Scope, image: ImageRecord) -> Result<ImageRecord> {
        let mut client = ImagesClient::new(self.channel.clone());
        let req = self.request(
            scope,
            CreateImageRequest {
                image: Some(to_pb_image(&image)),
                ..Default::default()
            },
        );
        match scope.run(async { client.create(req).await.map_err(rpc_err) }).await {
            Ok(resp) => Ok(resp.into_inner().image.map(from_pb_image).unwrap_or(image)),
            Err(RuneError::AlreadyExists(_)) => {
                let req = self.request(
                    scope,
                    UpdateImageRequest {
                        image: Some(to_pb_image(&image)),
                        update_mask: Some(FieldMask {
                            paths: vec!["target".to_string(), "labels".to_string()],
                        }),
                        ..Default::default()
                    },
                );
                let resp = scope.run(async { client.update(req).await.map_err(rpc_err) }).await?;
                Ok(resp.into_inner().image.map(from_pb_image).unwrap_or(image))
            }
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, scope: &Scope, name: &str) -> Result<()> {
        let mut client = ImagesClient::new(self.channel.clone());
        let req = self.request(
            scope,
            DeleteImageRequest {
                name: name.to_string(),
                sync: true,
                ..Default::default()
            },
        );
        scope.run(async { client.delete(req).await.map_err(rpc_err) }).await?;
        Ok(())
    }

    async fn read_blob(&self, scope: &Scope, digest: &str) -> Result<Vec<u8>> {
        let mut client = ContentClient::new(self.channel.clone());
        let req = self.request(
            scope,
            ReadContentRequest {
                digest: digest.to_string(),
                offset: 0,
                size: 0,
                ..Default::default()
            },
        );
        scope
            .run(async {
                let mut stream = client.read(req).await.map_err(rpc_err)?.into_inner();
                let mut data = Vec::new();
                while let Some(chunk) = stream.message().await.map_err(rpc_err)? {
                    data.extend_from_slice(&chunk.data);
                }
                Ok(data)
            })
            .await
    }

    async fn write_blob(
        &self,
        scope: &Scope,
        desc: &Descriptor,
        data: Vec<u8>,
        labels: HashMap<String, String>,
    ) -> Result<()> {
        let reference = format!("runectl-{}", uuid::Uuid::new_v4());
        let total = data.len() as i64;
        let mut messages: Vec<WriteContentRequest> = data
            .chunks(WRITE_CHUNK)
            .scan(0i64, |offset, chunk| {
                let msg = WriteContentRequest {
                    action: WriteAction::Write as i32,
                    r#ref: reference.clone(),
                    total,
                    expected: desc.digest.clone(),
                    offset: *offset,
                    data: chunk.to_vec(),
                    ..Default::default()
                };
                *offset += chunk.len() as i64;
                Some(msg)
            })
            .collect();
        messages.push(WriteContentRequest {
            action: WriteAction::Commit as i32,
            r#ref: reference.clone(),
            total,
            expected: desc.digest.clone(),
            offset: total,
            labels,
            ..Default::default()
        });

        let mut client = ContentClient::new(self.channel.clone());
        let req = self.request(scope, tokio_stream::iter(messages));
        let res = scope
            .run(async {
                let mut stream = client.write(req).await.map_err(rpc_err)?.into_inner();
                while stream.message().await.map_err(rpc_err)?.is_some() {}
                Ok(())
            })
            .await;
        match res {
            Err(RuneError::AlreadyExists(_)) => Ok(()),
            other => other,
        }
    }

    async fn apply_layer(&self, scope: &Scope, layer: &Descriptor, mounts: &[Mount]) -> Result<String> {
        let mut client = DiffClient::new(self.channel.clone());
        let req = self.request(
            scope,
            ApplyRequest {
                diff: Some(to_pb_descriptor(layer)),
                mounts: to_pb_mounts(mounts),
                ..Default::default()
            },
        );
        let resp = scope.run(async { client.apply(req).await.map_err(rpc_err) }).await?;
        resp.into_inner()
            .applied
            .map(|d| d.digest)
            .ok_or_else(|| RuneError::Rpc(format!("no diff returned for layer {}", layer.digest)))
    }

    async fn blob_exists(&self, scope: &Scope, digest: &str) -> Result<bool> {
        let mut client = ContentClient::new(self.channel.clone());
        let req = self.request(
            scope,
            InfoRequest {
                digest: digest.to_string(),
            },
        );
        match scope.run(async { client.info(req).await.map_err(rpc_err) }).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn label_blob(&self, scope: &Scope, digest: &str, labels: HashMap<String, String>) -> Result<()> {
        let paths = labels.keys().map(|k| format!("labels.{}", k)).collect();
        let mut client = ContentClient::new(self.channel.clone());
        let req = self.request(
            scope,
            UpdateRequest {
                info: Some(Info {
                    digest: digest.to_string(),
                    labels,
                    ..Default::default()
                }),
                update_mask: Some(FieldMask { paths }),
            },
        );
        scope.run(async { client.update(req).await.map_err(rpc_err) }).await?;
        Ok(())
    }
}

#[async_trait]
impl Snapshotter for ContainerdBackend {
    async fn prepare(&self, scope: &Scope, snapshotter: &str, key: &str, parent: &str) -> Result<Vec<Mount>> {
        let mut client = SnapshotsClient::new(self.channel.clone());
        let req = self.request(
            scope,
            PrepareSnapshotRequest {
                snapshotter: snapshotter.to_string(),
                key: key.to_string(),
                parent: parent.to_string(),
                ..Default::default()
            },
        );
        let resp = scope.run(async { client.prepare(req).await.map_err(rpc_err) }).await?;
        Ok(from_pb_mounts(resp.into_inner().mounts))
    }

    async fn view(&self, scope: &Scope, snapshotter: &str, key: &str, parent: &str) -> Result<Vec<Mount>> {
        let mut client = SnapshotsClient::new(self.channel.clone());
        let req = self.request(
            scope,
            ViewSnapshotRequest {
                snapshotter: snapshotter.to_string(),
                key: key.to_string(),
                parent: parent.to_string(),
                ..Default::default()
            },
        );
        let resp = scope.run(async { client.view(req).await.map_err(rpc_err) }).await?;
        Ok(from_pb_mounts(resp.into_inner().mounts))
    }

    async fn commit(&self, scope: &Scope, snapshotter: &str, name: &str, key: &str) -> Result<()> {
        let mut client = SnapshotsClient::new(self.channel.clone());
        let req = self.request(
            scope,
            CommitSnapshotRequest {
                snapshotter: snapshotter.to_string(),
                name: name.to_string(),
                key: key.to_string(),
                ..Default::default()
            },
        );
        scope.run(async { client.commit(req).await.map_err(rpc_err) }).await?;
        Ok(())
    }

    async fn remove(&self, scope: &Scope, snapshotter: &str, key: &str) -> Result<()> {
        let mut client = SnapshotsClient::new(self.channel.clone());
        let req = self.request(
            scope,
            RemoveSnapshotRequest {
                snapshotter: snapshotter.to_string(),
                key: key.to_string(),
                ..Default::default()
            },
        );
        scope.run(async { client.remove(req).await.map_err(rpc_err) }).await?;
        Ok(())
    }

    async fn mounts(&self, scope: &Scope, snapshotter: &str, key: &str) -> Result<Vec<Mount>> {
        let mut client = SnapshotsClient::new(self.channel.clone());
        let req = self.request(
            scope,
            MountsRequest {
                snapshotter: snapshotter.to_string(),
                key: key.to_string(),
                ..Default::default()
            },
        );
        let resp = scope.run(async { client.mounts(req).await.map_err(rpc_err) }).await?;
        Ok(from_pb_mounts(resp.into_inner().mounts))
    }

    async fn exists(&self, scope: &Scope, snapshotter: &str, key: &str) -> Result<bool> {
        let mut client = SnapshotsClient::new(self.channel.clone());
        let req = self.request(
            scope,
            StatSnapshotRequest {
                snapshotter: snapshotter.to_string(),
                key: key.to_string(),
                ..Default::default()
            },
        );
        match scope.run(async { client.stat(req).await.map_err(rpc_err) }).await {
            Ok(_) => Ok(true),
            Err(RuneError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl ContainerService for ContainerdBackend {
    async fn create(&self, scope: &Scope, container: ContainerRecord) -> Result<ContainerRecord> {
        let spec = match &container.spec {
            Some(spec) => Some(Any {
                type_url: SPEC_TYPE_URL.to_string(),
                value: serde_json::to_vec(spec)?,
            }),
            None => None,
        };
        let pb = Container {
            id: container.id.clone(),
            image: container.image.clone(),
            labels: container.labels.clone(),
            runtime: Some(Runtime {
                name: container.runtime.clone(),
                options: None,
            }),
            spec,
            snapshotter: container.snapshotter.clone(),
            snapshot_key: container.snapshot_key.clone(),
            ..Default::default()
        };
        let mut client = ContainersClient::new(self.channel.clone());
        let req = self.request(scope, CreateContainerRequest { container: Some(pb), ..Default::default() });
        let resp = scope.run(async { client.create(req).await.map_err(rpc_err) }).await?;
        Ok(resp
            .into_inner()
            .container
            .map(from_pb_container)
            .unwrap_or(container))
    }

    async fn get(&self, scope: &Scope, id: &str) -> Result<ContainerRecord> {
        let mut client = ContainersClient::new(self.channel.clone());
        let req = self.request(scope, GetContainerRequest { id: id.to_string(), ..Default::default() });
        let resp = scope.run(async { client.get(req).await.map_err(rpc_err) }).await?;
        resp.into_inner()
            .container
            .map(from_pb_container)
            .ok_or_else(|| RuneError::NotFound(format!("container {}", id)))
    }

    async fn list(&self, scope: &Scope) -> Result<Vec<ContainerRecord>> {
        let mut client = ContainersClient::new(self.channel.clone());
        let req = self.request(scope, ListContainersRequest::default());
        let resp = scope.run(async { client.list(req).await.map_err(rpc_err) }).await?;
        Ok(resp
            .into_inner()
            .containers
            .into_iter()
            .map(from_pb_container)
            .collect())
    }

    async fn update_labels(&self, scope: &Scope, id: &str, labels: HashMap<String, String>) -> Result<()> {
        let paths = labels.keys().map(|k| format!("labels.{}", k)).collect();
        let mut client = ContainersClient::new(self.channel.clone());
        let req = self.request(
            scope,
            UpdateContainerRequest {
                container: Some(Container {
                    id: id.to_string(),
                    labels,
                    ..Default::default()
                }),
                update_mask: Some(FieldMask { paths }),
            },
        );
        scope.run(async { client.update(req).await.map_err(rpc_err) }).await?;
        Ok(())
    }

    async fn delete(&self, scope: &Scope, id: &str) -> Result<()> {
        let mut client = ContainersClient::new(self.channel.clone());
        let req = self.request(scope, DeleteContainerRequest { id: id.to_string(), ..Default::default() });
        scope.run(async { client.delete(req).await.map_err(rpc_err) }).await?;
        Ok(())
    }
}

#[async_trait]
impl TaskService for ContainerdBackend {
    async fn create(&self, scope: &Scope, id: &str, rootfs: &[Mount], io: &TaskIo) -> Result<u32> {
        let mut client = TasksClient::new(self.channel.clone());
        let req = self.request(
            scope,
            CreateTaskRequest {
                container_id: id.to_string(),
                rootfs: to_pb_mounts(rootfs),
                stdin: io.stdin.clone(),
                stdout: io.stdout.clone(),
                stderr: io.stderr.clone(),
                terminal: io.terminal,
                ..Default::default()
            },
        );
        let resp = scope.run(async { client.create(req).await.map_err(rpc_err) }).await?;
        Ok(resp.into_inner().pid)
    }

    async fn start(&self, scope: &Scope, id: &str, exec_id: &str) -> Result<u32> {
        let mut client = TasksClient::new(self.channel.clone());
        let req = self.request(
            scope,
            StartRequest {
                container_id: id.to_string(),
                exec_id: exec_id.to_string(),
                ..Default::default()
            },
        );
        let resp = scope.run(async { client.start(req).await.map_err(rpc_err) }).await?;
        Ok(resp.into_inner().pid)
    }

    async fn get(&self, scope: &Scope, id: &str) -> Result<TaskInfo> {
        let mut client = TasksClient::new(self.channel.clone());
        let req = self.request(
            scope,
            GetRequest {
                container_id: id.to_string(),
                exec_id: String::new(),
                ..Default::default()
            },
        );
        let resp = scope.run(async { client.get(req).await.map_err(rpc_err) }).await?;
        let process = resp
            .into_inner()
            .process
            .ok_or_else(|| RuneError::NotFound(format!("task {}", id)))?;
        let status = task_status(process.status);
        Ok(TaskInfo {
            pid: process.pid,
            status,
            exit_status: (status == TaskStatus::Stopped).then_some(process.exit_status),
            exited_at: to_time(process.exited_at),
        })
    }

    async fn wait(&self, scope: &Scope, id: &str, exec_id: &str) -> Result<u32> {
        let mut client = TasksClient::new(self.channel.clone());
        let req = self.request(
            scope,
            WaitRequest {
                container_id: id.to_string(),
                exec_id: exec_id.to_string(),
                ..Default::default()
            },
        );
        let resp = scope.run(async { client.wait(req).await.map_err(rpc_err) }).await?;
        Ok(resp.into_inner().exit_status)
    }

    async fn kill(&self, scope: &Scope, id: &str, exec_id: &str, signal: u32, all: bool) -> Result<()> {
        let mut client = TasksClient::new(self.channel.clone());
        let req = self.request(
            scope,
            KillRequest {
                container_id: id.to_string(),
                exec_id: exec_id.to_string(),
                signal,
                all,
                ..Default::default()
            },
        );
        scope.run(async { client.kill(req).await.map_err(rpc_err) }).await?;
        Ok(())
    }

    async fn delete(&self, scope: &Scope, id: &str) -> Result<u32> {
        let mut client = TasksClient::new(self.channel.clone());
        let req = self.request(
            scope,
            DeleteTaskRequest {
                container_id: id.to_string(),
                ..Default::default()
            },
        );
        let resp = scope.run(async { client.delete(req).await.map_err(rpc_err) }).await?;
        Ok(resp.into_inner().exit_status)
    }

    async fn pause(&self, scope: &Scope, id: &str) -> Result<()> {
        let mut client = TasksClient::new(self.channel.clone());
        let req = self.request(scope, PauseTaskRequest { container_id: id.to_string(), ..Default::default() });
        scope.run(async { client.pause(req).await.map_err(rpc_err) }).await?;
        Ok(())
    }

    async fn resume(&self, scope: &Scope, id: &str) -> Result<()> {
        let mut client = TasksClient::new(self.channel.clone());
        let req = self.request(scope, ResumeTaskRequest { container_id: id.to_string(), ..Default::default() });
        scope.run(async { client.resume(req).await.map_err(rpc_err) }).await?;
        Ok(())
    }

    async fn exec(&self, scope: &Scope, id: &str, exec_id: &str, process: serde_json::Value, io: &TaskIo) -> Result<()> {
        let mut client = TasksClient::new(self.channel.clone());
        let req = self.request(
            scope,
            ExecProcessRequest {
                container_id: id.to_string(),
                stdin: io.stdin.clone(),
                stdout: io.stdout.clone(),
                stderr: io.stderr.clone(),
                terminal: io.terminal,
                spec: Some(Any {
                    type_url: PROCESS_TYPE_URL.to_string(),
                    value: serde_json::to_vec(&process)?,
                }),
                exec_id: exec_id.to_string(),
                ..Default::default()
            },
        );
        scope.run(async { client.exec(req).await.map_err(rpc_err) }).await?;
        Ok(())
    }

    async fn resize(&self, scope: &Scope, id: &str, exec_id: &str, width: u32, height: u32) -> Result<()> {
        let mut client = TasksClient::new(self.channel.clone());
        let req = self.request(
            scope,
            ResizePtyRequest {
                container_id: id.to_string(),
                exec_id: exec_id.to_string(),
                width,
                height,
                ..Default::default()
            },
        );
        scope.run(async { client.resize_pty(req).await.map_err(rpc_err) }).await?;
        Ok(())
    }

    async fn delete_process(&self, scope: &Scope, id: &str, exec_id: &str) -> Result<u32> {
        let mut client = TasksClient::new(self.channel.clone());
        let req = self.request(
            scope,
            DeleteProcessRequest {
                container_id: id.to_string(),
                exec_id: exec_id.to_string(),
                ..Default::default()
            },
        );
        let resp = scope.run(async { client.delete_process(req).await.map_err(rpc_err) }).await?;
        Ok(resp.into_inner().exit_status)
    }
}

#[async_trait]
impl LeaseManager for ContainerdBackend {
    async fn create(&self, scope: &Scope, expire: Duration) -> Result<String> {
        let expire_at = Utc::now() + chrono::Duration::seconds(expire.as_secs() as i64);
        let mut labels = HashMap::new();
        labels.insert(
            "containerd.io/gc.expire".to_string(),
            expire_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        );
        let mut client = LeasesClient::new(self.channel.clone());
        let req = self.request(
            scope,
            containerd_client::services::v1::CreateRequest {
                id: format!("runectl-{}", uuid::Uuid::new_v4()),
                labels,
                ..Default::default()
            },
        );
        let resp = scope.run(async { client.create(req).await.map_err(rpc_err) }).await?;
        resp.into_inner()
            .lease
            .map(|l| l.id)
            .ok_or_else(|| RuneError::Rpc("lease not returned".to_string()))
    }

    async fn delete(&self, scope: &Scope, id: &str) -> Result<()> {
        let mut client = LeasesClient::new(self.channel.clone());
        let req = self.request(
            scope,
            containerd_client::services::v1::DeleteRequest {
                id: id.to_string(),
                sync: false,
                ..Default::default()
            },
        );
        scope.run(async { client.delete(req).await.map_err(rpc_err) }).await?;
        Ok(())
    }
}
