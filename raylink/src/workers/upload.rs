//! Upload worker
//!
//! Inputs: `files` (local paths), `remote_dir` (optional, defaults to the
//! session's upload home), `run`. Output: `remote_paths`.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use shared_types::DiagnosticLevel;

use crate::actors::RemoteSession;
use crate::host::{read_gate, read_string, read_string_list, IterationAccess};
use crate::orchestrator::{Dispatch, NodeState, Worker, WorkerContext, WorkerError};
use crate::remote::{Globals, RemoteError};

const CHANNEL_REMOTE_PATHS: &str = "remote_paths";

pub struct UploadWorker {
    session: RemoteSession,
    globals: Arc<Globals>,
    files: Vec<PathBuf>,
    remote_dir: Option<String>,
    uploaded: Vec<String>,
}

impl UploadWorker {
    pub fn new(session: RemoteSession, globals: Arc<Globals>) -> Self {
        Self {
            session,
            globals,
            files: Vec::new(),
            remote_dir: None,
            uploaded: Vec::new(),
        }
    }
}

#[async_trait]
impl Worker for UploadWorker {
    fn name(&self) -> &str {
        "upload"
    }

    fn duplicate(&self) -> Option<Box<dyn Worker>> {
        Some(Box::new(Self::new(self.session.clone(), self.globals.clone())))
    }

    fn pull_inputs(
        &mut self,
        access: &mut dyn IterationAccess,
        _state: &mut NodeState,
    ) -> Result<Dispatch, WorkerError> {
        if !read_gate(access, "run") {
            return Ok(Dispatch::Skip);
        }
        let files: Vec<PathBuf> = read_string_list(access, "files")
            .into_iter()
            .filter(|f| !f.trim().is_empty())
            .map(|f| PathBuf::from(self.globals.apply(&f).text))
            .collect();
        if files.is_empty() {
            return Err(WorkerError::InvalidInput("No files given".to_string()));
        }
        self.files = files;
        self.remote_dir = read_string(access, "remote_dir").map(|dir| self.globals.apply(&dir).text);
        Ok(Dispatch::Run)
    }

    async fn run(&mut self, ctx: WorkerContext) -> Result<(), WorkerError> {
        let remote_dir = match &self.remote_dir {
            Some(dir) => dir.clone(),
            None => self
                .session
                .info()
                .await
                .upload_home
                .ok_or(WorkerError::Remote(RemoteError::NotConnected))?,
        };

        let total = self.files.len();
        self.uploaded.clear();
        for (i, file) in self.files.iter().enumerate() {
            ctx.checkpoint()?;
            let remote_path = self.session.upload(file, &remote_dir).await?;
            tracing::debug!(iteration = ctx.iteration, local = %file.display(), remote = %remote_path, "Uploaded");
            self.uploaded.push(remote_path);
            ctx.progress.report((i + 1) as f64 / total as f64);
        }
        Ok(())
    }

    fn push_outputs(&mut self, access: &mut dyn IterationAccess, state: &mut NodeState) {
        state.store(
            CHANNEL_REMOTE_PATHS,
            access.iteration(),
            Some(self.uploaded.join("\n")),
        );
        access.set_output(CHANNEL_REMOTE_PATHS, json!(self.uploaded));
    }

    fn push_cached(&mut self, access: &mut dyn IterationAccess, state: &NodeState) {
        match state.cached(CHANNEL_REMOTE_PATHS, access.iteration()) {
            Some(paths) => {
                let paths: Vec<&str> = paths.lines().collect();
                access.set_output(CHANNEL_REMOTE_PATHS, json!(paths));
            }
            None => access.add_diagnostic(
                DiagnosticLevel::Remark,
                "Nothing uploaded yet. Set run to true to upload".to_string(),
            ),
        }
    }

    fn describe(&self) -> Option<String> {
        Some(format!("Upload {} file(s)", self.files.len()))
    }
}
