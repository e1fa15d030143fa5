//! Data-plane access.
//!
//! The coordinators ask the data plane a small set of questions: may an OSD
//! be stopped, are placement groups clean, rotate a daemon's auth key, dump
//! OSD liveness, report device classes, and report the daemon version
//! spread. Production shells out to the `ceph` CLI with JSON output; tests
//! use the scripted fake.

pub mod ceph;
#[cfg(test)]
pub mod fake;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

/// The error surface of the ok-to-stop predicate.
///
/// "The data plane says no" and "the data plane could not answer" are
/// distinct: a refusal is a safety gate and is retried indefinitely, while a
/// failed query is retried a bounded number of times.
#[derive(Debug, Error)]
pub enum OkToStopError {
    /// The data plane answered: stopping this OSD would lose availability.
    #[error("osd.{0} is not safe to stop")]
    NotSafe(i32),
    /// The data plane could not answer the query.
    #[error("ok-to-stop query failed: {0}")]
    Unavailable(#[source] anyhow::Error),
}

/// One OSD's liveness entry from the data plane's OSD dump.
#[derive(Clone, Debug, Deserialize)]
pub struct OsdDumpEntry {
    /// The OSD's stable integer id.
    pub osd: i32,
    /// Liveness flag, 1 when the daemon is up.
    pub up: u8,
}

impl OsdDumpEntry {
    /// Indicates if the daemon is up.
    pub fn is_up(&self) -> bool {
        self.up != 0
    }
}

/// The interface over the data plane's control surface.
#[async_trait]
pub trait DataPlane: Send + Sync {
    /// Ask which OSDs may be stopped together with the given one.
    ///
    /// Returns the set of ids (including `id` itself) which are safe to stop
    /// at the same time, capped at `max` entries.
    async fn ok_to_stop(&self, id: i32, max: u32) -> Result<Vec<i32>, OkToStopError>;

    /// Indicates if all placement groups are clean.
    async fn pgs_clean(&self) -> Result<bool>;

    /// Rotate the auth key for the given entity, e.g. `osd.3`.
    async fn auth_rotate(&self, entity: &str) -> Result<()>;

    /// Dump the liveness of every OSD known to the data plane.
    async fn osd_dump(&self) -> Result<Vec<OsdDumpEntry>>;

    /// The crush device class currently assigned to the given OSD.
    async fn crush_get_device_class(&self, id: i32) -> Result<String>;

    /// The OSD daemon version spread, version string to daemon count.
    async fn versions(&self) -> Result<HashMap<String, u32>>;
}
