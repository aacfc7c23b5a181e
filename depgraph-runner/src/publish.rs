//! Plan persistence for the CLI: every mutation is written back to the
//! plan file, so an aborted run can be inspected, retriggered and resumed.

use anyhow::Context;
use async_trait::async_trait;
use depgraph_core::plan::ReleasePlan;
use depgraph_core::{codec, Publisher};
use std::path::PathBuf;

pub struct FilePublisher {
    path: PathBuf,
}

impl FilePublisher {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl Publisher for FilePublisher {
    async fn publish(&self, plan: &ReleasePlan) -> anyhow::Result<()> {
        let json = codec::encode(plan)?;
        // Write-then-rename so a crash mid-write never truncates the
        // only copy of the plan.
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("could not write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("could not replace {}", self.path.display()))?;
        Ok(())
    }
}
