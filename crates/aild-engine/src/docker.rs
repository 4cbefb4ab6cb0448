//! `BuildEngine` implementation on top of the docker CLI.
//!
//! A build description is solved by copying the local mounts into a
//! stopped container and committing it; the resulting image id is the
//! snapshot reference. Containers run that image with `docker run -d`
//! and later processes join it through `docker exec`.

use std::path::{Path, PathBuf};

use aild_core::{
    BuildEngine, Container, ContainerProcess, Definition, EngineError, Gateway,
    NewContainerRequest, ProgressSender, Reference, SolveOptions, SolveResult, SolveStatus,
    StartRequest, progress,
};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    command::{CommandError, DockerCli},
    process::{DetachedProcess, PipedProcess, TerminalProcess},
};

/// Server section of `docker version`.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerVersion {
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "ApiVersion", default)]
    pub api_version: Option<String>,
}

/// Parse the output of `docker version --format '{{json .Server}}'`.
///
/// A daemon that cannot be reached renders as `null`.
fn parse_server_version(output: &str) -> Result<Option<ServerVersion>, serde_json::Error> {
    serde_json::from_str(output.trim())
}

/// Connected docker engine.
#[derive(Debug, Clone)]
pub struct DockerEngine {
    cli: DockerCli,
    server: ServerVersion,
}

impl DockerEngine {
    #[must_use]
    pub const fn cli(&self) -> &DockerCli {
        &self.cli
    }

    #[must_use]
    pub const fn server(&self) -> &ServerVersion {
        &self.server
    }
}

#[async_trait]
impl BuildEngine for DockerEngine {
    const START_HINT: &'static str = "Make sure the Docker daemon is running (for example \
        `sudo systemctl start docker` or by starting Docker Desktop), or point \
        AILD_ENGINE_HOST at a reachable engine.";

    async fn connect(address: &str, cancel: &CancellationToken) -> Result<Self, EngineError> {
        let connect_error = |message: String| EngineError::Connect {
            address: address.to_string(),
            message,
        };

        let cli = DockerCli::locate(address)
            .await
            .map_err(|e| connect_error(e.to_string()))?;
        let output = cli
            .command(["version", "--format", "{{json .Server}}"])
            .output(cancel)
            .await
            .map_err(|e| match e {
                CommandError::Cancelled { .. } => EngineError::Cancelled,
                CommandError::Failed { stderr, .. } => connect_error(stderr),
                other => connect_error(other.to_string()),
            })?;

        let server = parse_server_version(&output)
            .map_err(|e| connect_error(format!("unexpected version output: {e}")))?
            .ok_or_else(|| connect_error("engine did not report a server version".into()))?;

        tracing::debug!(
            %address,
            version = %server.version,
            api = server.api_version.as_deref().unwrap_or("unknown"),
            "connected to docker engine"
        );
        Ok(Self { cli, server })
    }

    async fn build<T, E, F>(
        &self,
        options: SolveOptions,
        progress: ProgressSender,
        cancel: CancellationToken,
        build: F,
    ) -> Result<T, E>
    where
        T: Send + 'static,
        E: From<EngineError> + Send + 'static,
        F: for<'g> FnOnce(&'g dyn Gateway) -> BoxFuture<'g, Result<T, E>> + Send + 'static,
    {
        let gateway = DockerGateway::new(self.cli.clone(), options, progress, cancel);
        let handle: &dyn Gateway = &gateway;
        let result = build(handle).await;
        // Closes the progress channel so the drain task can finish.
        drop(gateway);
        result
    }
}

/// Gateway handed to the build closure.
pub struct DockerGateway {
    cli: DockerCli,
    options: SolveOptions,
    progress: ProgressSender,
    cancel: CancellationToken,
}

impl DockerGateway {
    #[must_use]
    pub const fn new(
        cli: DockerCli,
        options: SolveOptions,
        progress: ProgressSender,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            cli,
            options,
            progress,
            cancel,
        }
    }

    fn local_path(&self, mount: &str, source: &str) -> Result<PathBuf, EngineError> {
        let root = self
            .options
            .local_mounts
            .get(mount)
            .ok_or_else(|| EngineError::Solve(format!("unknown local mount `{mount}`")))?;
        Ok(root.join(source.trim_start_matches('/')))
    }

    async fn populate(&self, id: &str, definition: &Definition) -> Result<Reference, EngineError> {
        for copy in &definition.copies {
            let vertex = copy.display_name();
            progress::report(&self.progress, SolveStatus::started(&vertex)).await;

            let source = self.local_path(&copy.mount, &copy.source)?;
            let result = self
                .cli
                .command([
                    "cp".to_string(),
                    copy_source(&source),
                    format!("{id}:{}", copy.dest),
                ])
                .output(&self.cancel)
                .await;
            if let Err(err) = result {
                progress::report(&self.progress, SolveStatus::errored(&vertex)).await;
                return Err(err.into_engine(EngineError::Solve));
            }
            progress::report(&self.progress, SolveStatus::completed(&vertex)).await;
        }

        let vertex = "committing snapshot";
        progress::report(&self.progress, SolveStatus::started(vertex)).await;
        let image = self
            .cli
            .command(["commit", id])
            .output(&self.cancel)
            .await
            .map_err(|e| e.into_engine(EngineError::Solve))?;
        progress::report(&self.progress, SolveStatus::completed(vertex)).await;
        Ok(Reference::new(image))
    }
}

/// `<dir>/.` so `docker cp` copies the directory's contents, not the directory.
fn copy_source(path: &Path) -> String {
    let mut rendered = path.to_string_lossy().into_owned();
    if !rendered.ends_with('/') {
        rendered.push('/');
    }
    rendered.push('.');
    rendered
}

#[async_trait]
impl Gateway for DockerGateway {
    async fn solve(&self, definition: &Definition) -> Result<SolveResult, EngineError> {
        // Fail on unknown mounts before anything is created.
        for copy in &definition.copies {
            self.local_path(&copy.mount, &copy.source)?;
        }

        let base = format!("base image {}", definition.image);
        progress::report(&self.progress, SolveStatus::started(&base)).await;
        let id = self
            .cli
            .command(["create", "--entrypoint", "/bin/sh", definition.image.as_str()])
            .output(&self.cancel)
            .await
            .map_err(|e| e.into_engine(EngineError::Solve))?;
        progress::report(&self.progress, SolveStatus::completed(&base)).await;

        let result = self.populate(&id, definition).await;

        if let Err(err) = self
            .cli
            .command(["rm", "-f", id.as_str()])
            .output(&CancellationToken::new())
            .await
        {
            tracing::warn!(%err, %id, "failed to remove build container");
        }

        let reference = result?;
        tracing::debug!(%reference, "definition solved");
        Ok(SolveResult::single(reference))
    }

    async fn new_container(
        &self,
        request: NewContainerRequest,
    ) -> Result<Box<dyn Container>, EngineError> {
        let image = request
            .root_reference()
            .cloned()
            .ok_or_else(|| EngineError::Container("no reference mounted at /".into()))?;
        Ok(Box::new(DockerContainer::new(self.cli.clone(), image)))
    }
}

/// A container running a solved snapshot.
///
/// Nothing runs until the first `start`, which becomes the container's
/// main process; every later start is a `docker exec`.
pub struct DockerContainer {
    cli: DockerCli,
    name: String,
    image: Reference,
    running: Mutex<bool>,
}

impl DockerContainer {
    #[must_use]
    pub fn new(cli: DockerCli, image: Reference) -> Self {
        Self {
            cli,
            name: format!("aild-{}", uuid::Uuid::new_v4().simple()),
            image,
            running: Mutex::new(false),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn image(&self) -> &Reference {
        &self.image
    }
}

#[async_trait]
impl Container for DockerContainer {
    async fn start(
        &self,
        request: StartRequest,
        cancel: CancellationToken,
    ) -> Result<Box<dyn ContainerProcess>, EngineError> {
        let mut running = self.running.lock().await;
        if !*running {
            let parts = self
                .cli
                .run_detached(&self.name, self.image.as_str(), &request);
            let process =
                DetachedProcess::start(self.cli.clone(), self.name.clone(), &parts, cancel).await?;
            *running = true;
            return Ok(Box::new(process));
        }
        drop(running);

        let parts = self.cli.exec(&self.name, &request);
        if request.tty {
            Ok(Box::new(TerminalProcess::spawn(&parts, cancel)?))
        } else {
            Ok(Box::new(PipedProcess::spawn(&parts, request.stdio, cancel)?))
        }
    }

    async fn release(&self) -> Result<(), EngineError> {
        let cleanup = CancellationToken::new();
        let mut first_error = None;

        if *self.running.lock().await {
            if let Err(err) = self
                .cli
                .command(["rm", "-f", self.name.as_str()])
                .output(&cleanup)
                .await
            {
                first_error = Some(err.into_engine(EngineError::Container));
            }
        }
        if let Err(err) = self
            .cli
            .command(["rmi", self.image.as_str()])
            .output(&cleanup)
            .await
        {
            first_error.get_or_insert(err.into_engine(EngineError::Container));
        }

        tracing::debug!(name = %self.name, "container released");
        first_error.map_or(Ok(()), Err)
    }
}
