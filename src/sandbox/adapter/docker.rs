//! Container substrate backed by the Docker Engine API.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::Engine as _;
use bollard::container::LogOutput;
use bollard::errors::Error as DockerError;
use bollard::models::{ContainerCreateBody, HostConfig, ResourcesUlimits};
use bollard::query_parameters::{
    AttachContainerOptionsBuilder, CreateContainerOptionsBuilder, ListContainersOptionsBuilder,
    RemoveContainerOptionsBuilder, StartContainerOptions, WaitContainerOptions,
};
use bollard::Docker;
use futures_util::stream::StreamExt;
use tokio::io::AsyncWriteExt;

use super::{GuestRun, GuestSink, RuntimeAdapter, SandboxHandle, OUTPUT_CHANNEL_CAPACITY};
use crate::error::{Result, SandboxError};
use crate::sandbox::limits::SandboxLimits;
use crate::sandbox::profile::LanguageProfile;
use crate::sandbox::types::{OutputStream, RequestId};

/// Label present on every container this engine creates.
pub const MANAGED_LABEL: &str = "code-sandbox-engine.managed";
/// Label holding the owning request id.
pub const REQUEST_LABEL: &str = "code-sandbox-engine.request";

/// Unprivileged uid:gid the guest runs as.
const GUEST_USER: &str = "65534:65534";
const GUEST_PATH: &str = "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Runs each request in a fresh, locked-down container.
#[derive(Debug, Clone)]
pub struct DockerAdapter {
    docker: Docker,
}

impl DockerAdapter {
    /// Connect to the local Docker daemon using the environment defaults.
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    /// Wrap an existing client.
    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    /// Check that the daemon answers.
    pub async fn ping(&self) -> Result<()> {
        self.docker.ping().await?;
        Ok(())
    }

    /// Force-remove every container left behind by a previous engine process.
    ///
    /// Returns the number of containers removed.
    pub async fn reap_orphans(&self) -> Result<usize> {
        let removed = self.reap_labelled(MANAGED_LABEL).await?;
        if removed > 0 {
            tracing::info!(removed, "reaped orphaned sandboxes");
        }
        Ok(removed)
    }

    /// Force-remove every container matching a `label` or `label=value` filter.
    async fn reap_labelled(&self, label: &str) -> Result<usize> {
        let mut filters = HashMap::new();
        filters.insert("label", vec![label]);
        let options = ListContainersOptionsBuilder::default()
            .all(true)
            .filters(&filters)
            .build();

        let containers = self.docker.list_containers(Some(options)).await?;
        let mut removed = 0;
        for id in containers.into_iter().filter_map(|c| c.id) {
            match self.destroy_runtime(&id).await {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(container = %id, error = %e, "failed to reap container"),
            }
        }
        Ok(removed)
    }
}

/// Shell launcher: the first stdin line is the base64 source, which is decoded
/// into the scratch area before the toolchain is exec'd with the remainder of
/// stdin.
fn launcher_script(profile: &LanguageProfile) -> String {
    format!(
        "IFS= read -r src && printf %s \"$src\" | base64 -d > /tmp/{} && {}",
        profile.source_file, profile.command
    )
}

/// Bytes written to the container's stdin.
fn stdin_payload(source: &str, stdin: Option<&str>) -> Vec<u8> {
    let encoded = base64::engine::general_purpose::STANDARD.encode(source);
    let mut payload = Vec::with_capacity(encoded.len() + 1 + stdin.map_or(0, str::len));
    payload.extend_from_slice(encoded.as_bytes());
    payload.push(b'\n');
    if let Some(stdin) = stdin {
        payload.extend_from_slice(stdin.as_bytes());
    }
    payload
}

fn host_config(limits: &SandboxLimits, exec_scratch: bool) -> HostConfig {
    let exec = if exec_scratch { "exec" } else { "noexec" };
    let tmpfs = HashMap::from([(
        "/tmp".to_string(),
        format!("rw,{exec},nosuid,nodev,size={}", limits.tmpfs_bytes),
    )]);
    let ulimit = |name: &str, value: u32| ResourcesUlimits {
        name: Some(name.to_string()),
        soft: Some(i64::from(value)),
        hard: Some(i64::from(value)),
    };

    HostConfig {
        memory: Some(clamp_i64(limits.memory_bytes)),
        // Equal to memory: no swap.
        memory_swap: Some(clamp_i64(limits.memory_bytes)),
        nano_cpus: Some(clamp_i64(limits.nano_cpus)),
        pids_limit: Some(i64::from(limits.max_processes)),
        ulimits: Some(vec![
            ulimit("nofile", limits.max_open_files),
            ulimit("nproc", limits.max_processes),
        ]),
        readonly_rootfs: Some(true),
        tmpfs: Some(tmpfs),
        network_mode: Some("none".to_string()),
        cap_drop: Some(vec!["ALL".to_string()]),
        security_opt: Some(vec!["no-new-privileges".to_string()]),
        ..Default::default()
    }
}

fn container_body(
    profile: &LanguageProfile,
    limits: &SandboxLimits,
    request_id: RequestId,
) -> ContainerCreateBody {
    let labels = HashMap::from([
        (MANAGED_LABEL.to_string(), "true".to_string()),
        (REQUEST_LABEL.to_string(), request_id.to_string()),
    ]);

    ContainerCreateBody {
        image: Some(profile.image.clone()),
        cmd: Some(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            launcher_script(profile),
        ]),
        user: Some(GUEST_USER.to_string()),
        working_dir: Some("/tmp".to_string()),
        env: Some(vec![GUEST_PATH.to_string(), "HOME=/tmp".to_string()]),
        labels: Some(labels),
        network_disabled: Some(true),
        tty: Some(false),
        open_stdin: Some(true),
        stdin_once: Some(true),
        attach_stdin: Some(true),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        host_config: Some(host_config(limits, profile.exec_scratch)),
        ..Default::default()
    }
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn is_gone(err: &DockerError) -> bool {
    // 404: no such container. 409: removal already in progress.
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 404 | 409,
            ..
        }
    )
}

async fn wait_exit(docker: &Docker, container_id: &str) -> Result<i64> {
    let mut wait = docker.wait_container(container_id, None::<WaitContainerOptions>);
    match wait.next().await {
        Some(Ok(response)) => Ok(response.status_code),
        // Non-zero exits surface as an error carrying the code.
        Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
        Some(Err(e)) => Err(e.into()),
        None => Err(super::exit_dropped()),
    }
}

async fn pump(
    docker: Docker,
    container_id: String,
    payload: Vec<u8>,
    attached: bollard::container::AttachContainerResults,
    sink: GuestSink,
) {
    let bollard::container::AttachContainerResults { mut output, mut input } = attached;

    let write = async move {
        input.write_all(&payload).await?;
        input.shutdown().await
    };

    let read = async {
        while let Some(frame) = output.next().await {
            let forwarded = match frame {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                    sink.send(OutputStream::Stdout, message).await
                }
                Ok(LogOutput::StdErr { message }) => sink.send(OutputStream::Stderr, message).await,
                Ok(LogOutput::StdIn { .. }) => true,
                Err(e) => {
                    tracing::debug!(container = %container_id, error = %e, "attach stream ended");
                    break;
                }
            };
            if !forwarded {
                break;
            }
        }
    };

    let (written, ()) = tokio::join!(write, read);
    if let Err(e) = written {
        // The guest may exit without reading its stdin.
        tracing::debug!(container = %container_id, error = %e, "stdin write failed");
    }

    let exit = wait_exit(&docker, &container_id).await;
    sink.finish(exit);
}

#[async_trait]
impl RuntimeAdapter for DockerAdapter {
    #[tracing::instrument(skip_all, fields(language = %profile.language, request_id = %request_id))]
    async fn create(
        &self,
        profile: &LanguageProfile,
        limits: &SandboxLimits,
        request_id: RequestId,
    ) -> Result<SandboxHandle> {
        if !limits.is_bounded() {
            return Err(SandboxError::Config(
                "every sandbox limit must be non-zero".to_string(),
            ));
        }

        let options = CreateContainerOptionsBuilder::default()
            .name(&format!("sandbox-{request_id}"))
            .build();
        let body = container_body(profile, limits, request_id);
        let created = self.docker.create_container(Some(options), body).await?;
        for warning in &created.warnings {
            tracing::warn!(container = %created.id, %warning, "docker create warning");
        }

        tracing::debug!(container = %created.id, image = %profile.image, "container created");
        Ok(SandboxHandle::new(
            created.id,
            request_id,
            profile.language,
            *limits,
        ))
    }

    #[tracing::instrument(skip_all, fields(container = %handle.runtime_id()))]
    async fn run(
        &self,
        handle: &SandboxHandle,
        source: &str,
        stdin: Option<&str>,
    ) -> Result<GuestRun> {
        let container_id = handle.runtime_id().to_string();

        // Attach before starting so no output is lost.
        let attach = AttachContainerOptionsBuilder::default()
            .stdin(true)
            .stdout(true)
            .stderr(true)
            .stream(true)
            .build();
        let attached = self
            .docker
            .attach_container(&container_id, Some(attach))
            .await?;
        self.docker
            .start_container(&container_id, None::<StartContainerOptions>)
            .await?;

        let (sink, run) = GuestRun::channel(OUTPUT_CHANNEL_CAPACITY);
        let payload = stdin_payload(source, stdin);
        tokio::spawn(pump(
            self.docker.clone(),
            container_id,
            payload,
            attached,
            sink,
        ));
        Ok(run)
    }

    #[tracing::instrument(skip(self))]
    async fn destroy_runtime(&self, runtime_id: &str) -> Result<()> {
        let options = RemoveContainerOptionsBuilder::default()
            .force(true)
            .v(true)
            .build();
        match self.docker.remove_container(runtime_id, Some(options)).await {
            Ok(()) => {
                tracing::debug!("container removed");
                Ok(())
            }
            Err(e) if is_gone(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn reap_request(&self, request_id: RequestId) -> Result<usize> {
        let removed = self
            .reap_labelled(&format!("{REQUEST_LABEL}={request_id}"))
            .await?;
        if removed > 0 {
            tracing::warn!(%request_id, removed, "reaped container from abandoned create");
        }
        Ok(removed)
    }

    async fn health_check(&self) -> Result<()> {
        self.ping().await
    }

    fn name(&self) -> &str {
        "docker"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::types::Language;

    #[test]
    fn test_container_is_locked_down() {
        let profile = LanguageProfile::default_for(Language::Python);
        let body = container_body(&profile, &profile.limits, RequestId::new());
        let host = body.host_config.unwrap();

        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert_eq!(host.readonly_rootfs, Some(true));
        assert_eq!(host.cap_drop, Some(vec!["ALL".to_string()]));
        assert_eq!(host.security_opt, Some(vec!["no-new-privileges".to_string()]));
        assert_eq!(host.pids_limit, Some(50));
        assert_eq!(host.memory, host.memory_swap);
        assert!(host.binds.is_none());
        assert_eq!(body.user.as_deref(), Some(GUEST_USER));
        assert_eq!(body.network_disabled, Some(true));

        let tmpfs = host.tmpfs.unwrap();
        assert_eq!(tmpfs["/tmp"], "rw,noexec,nosuid,nodev,size=52428800");
    }

    #[test]
    fn test_cpp_scratch_is_executable() {
        let profile = LanguageProfile::default_for(Language::Cpp);
        let host = host_config(&profile.limits, profile.exec_scratch);
        let tmpfs = host.tmpfs.unwrap();
        assert!(tmpfs["/tmp"].starts_with("rw,exec,nosuid,nodev"));
    }

    #[test]
    fn test_ulimits() {
        let host = host_config(&SandboxLimits::default(), false);
        let ulimits = host.ulimits.unwrap();
        let nofile = ulimits
            .iter()
            .find(|u| u.name.as_deref() == Some("nofile"))
            .unwrap();
        assert_eq!(nofile.hard, Some(100));
    }

    #[test]
    fn test_labels_carry_request() {
        let id = RequestId::new();
        let profile = LanguageProfile::default_for(Language::Java);
        let labels = container_body(&profile, &profile.limits, id).labels.unwrap();
        assert_eq!(labels[REQUEST_LABEL], id.to_string());
        assert_eq!(labels[MANAGED_LABEL], "true");
    }

    #[test]
    fn test_payload_layout() {
        let payload = stdin_payload("print('hi')", Some("42\n"));
        let text = String::from_utf8(payload).unwrap();
        let (first, rest) = text.split_once('\n').unwrap();

        let decoded = base64::engine::general_purpose::STANDARD
            .decode(first)
            .unwrap();
        assert_eq!(decoded, b"print('hi')");
        assert_eq!(rest, "42\n");
    }

    #[test]
    fn test_launcher_writes_source_file() {
        let profile = LanguageProfile::default_for(Language::JavaScript);
        let script = launcher_script(&profile);
        assert!(script.contains("> /tmp/main.js"));
        assert!(script.ends_with("exec node /tmp/main.js"));
    }
}
