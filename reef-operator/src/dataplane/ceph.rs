//! The production data plane over the `ceph` CLI.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tokio::time::timeout;

use crate::dataplane::{DataPlane, OkToStopError, OsdDumpEntry};

/// The default timeout used for data-plane queries.
const TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// A [`DataPlane`] which shells out to the `ceph` admin tool.
pub struct CephTool {
    /// Path of the admin tool binary.
    tool: String,
    /// Path of the cluster config file handed to every invocation.
    conf: String,
}

impl CephTool {
    /// Create a new instance.
    pub fn new(tool: impl Into<String>, conf: impl Into<String>) -> Self {
        Self { tool: tool.into(), conf: conf.into() }
    }

    /// Run the tool with the given args, returning its stdout on success.
    async fn exec(&self, args: &[&str]) -> Result<std::process::Output> {
        let mut cmd = Command::new(&self.tool);
        cmd.args(args)
            .args(["--conf", &self.conf, "--format", "json"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        tracing::debug!(tool = %self.tool, ?args, "invoking data-plane tool");
        timeout(TOOL_TIMEOUT, cmd.output())
            .await
            .with_context(|| format!("timeout invoking {} {:?}", &self.tool, args))?
            .with_context(|| format!("error invoking {} {:?}", &self.tool, args))
    }

    /// Run the tool and parse its stdout as JSON, failing on non-zero exit.
    async fn exec_json<T: serde::de::DeserializeOwned>(&self, args: &[&str]) -> Result<T> {
        let output = self.exec(args).await?;
        if !output.status.success() {
            bail!("{} {:?} exited with {}: {}", &self.tool, args, output.status, String::from_utf8_lossy(&output.stderr));
        }
        serde_json::from_slice(&output.stdout).with_context(|| format!("error parsing output of {} {:?}", &self.tool, args))
    }
}

#[derive(Deserialize)]
struct OkToStopOutput {
    #[serde(default)]
    osds: Vec<i32>,
}

#[derive(Deserialize)]
struct OsdDumpOutput {
    #[serde(default)]
    osds: Vec<OsdDumpEntry>,
}

#[derive(Deserialize)]
struct StatusOutput {
    #[serde(default)]
    pgmap: PgMap,
}

#[derive(Default, Deserialize)]
struct PgMap {
    #[serde(default)]
    num_pgs: u64,
    #[serde(default)]
    pgs_by_state: Vec<PgStateCount>,
}

#[derive(Deserialize)]
struct PgStateCount {
    state_name: String,
    count: u64,
}

#[derive(Deserialize)]
struct VersionsOutput {
    #[serde(default)]
    osd: HashMap<String, u32>,
}

#[async_trait]
impl DataPlane for CephTool {
    async fn ok_to_stop(&self, id: i32, max: u32) -> Result<Vec<i32>, OkToStopError> {
        let id_arg = id.to_string();
        let max_arg = max.to_string();
        let args = ["osd", "ok-to-stop", &id_arg, "--max", &max_arg];
        let output = self.exec(&args).await.map_err(OkToStopError::Unavailable)?;
        if !output.status.success() {
            // A refusal comes back as a clean non-zero exit with a JSON body
            // on stderr; anything else means the query itself failed.
            return Err(OkToStopError::NotSafe(id));
        }
        let parsed: OkToStopOutput = serde_json::from_slice(&output.stdout)
            .map_err(|err| OkToStopError::Unavailable(anyhow!("error parsing ok-to-stop output: {}", err)))?;
        if parsed.osds.is_empty() {
            Ok(vec![id])
        } else {
            Ok(parsed.osds)
        }
    }

    async fn pgs_clean(&self) -> Result<bool> {
        let status: StatusOutput = self.exec_json(&["status"]).await?;
        if status.pgmap.num_pgs == 0 {
            return Ok(true);
        }
        Ok(status.pgmap.pgs_by_state.iter().all(|pg| pg.count == 0 || pg.state_name.starts_with("active+clean")))
    }

    async fn auth_rotate(&self, entity: &str) -> Result<()> {
        let _: serde_json::Value = self.exec_json(&["auth", "rotate", entity]).await?;
        Ok(())
    }

    async fn osd_dump(&self) -> Result<Vec<OsdDumpEntry>> {
        let dump: OsdDumpOutput = self.exec_json(&["osd", "dump"]).await?;
        Ok(dump.osds)
    }

    async fn crush_get_device_class(&self, id: i32) -> Result<String> {
        let id_arg = format!("osd.{}", id);
        let classes: Vec<String> = self.exec_json(&["osd", "crush", "get-device-class", &id_arg]).await?;
        classes.into_iter().next().context("data plane returned no device class")
    }

    async fn versions(&self) -> Result<HashMap<String, u32>> {
        let versions: VersionsOutput = self.exec_json(&["versions"]).await?;
        Ok(versions.osd)
    }
}
