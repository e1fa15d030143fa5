//! A scripted in-memory [`DataPlane`] used by tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::dataplane::{DataPlane, OkToStopError, OsdDumpEntry};

/// The scripted behavior behind a [`FakeDataPlane`].
#[derive(Default)]
pub struct FakeDataPlaneState {
    /// OSD ids for which ok-to-stop answers "not safe".
    pub not_safe: HashSet<i32>,
    /// Number of ok-to-stop calls which will fail outright before recovering.
    pub unavailable_calls: u32,
    /// Batch answers per id; ids without an entry answer with themselves only.
    pub batches: HashMap<i32, Vec<i32>>,
    /// Whether all placement groups are clean.
    pub pgs_clean: bool,
    /// Entities rotated via auth-rotate, in call order.
    pub rotated: Vec<String>,
    /// The OSD dump returned to the health monitor.
    pub dump: Vec<OsdDumpEntry>,
    /// Device classes per OSD id.
    pub device_classes: HashMap<i32, String>,
    /// The daemon version spread returned to the update coordinator.
    pub versions: HashMap<String, u32>,
    /// Count of ok-to-stop calls.
    pub ok_to_stop_calls: u32,
    /// Count of versions calls.
    pub versions_calls: u32,
}

/// A scripted data plane recording every call the coordinators make.
pub struct FakeDataPlane {
    pub state: Mutex<FakeDataPlaneState>,
}

impl Default for FakeDataPlane {
    fn default() -> Self {
        Self {
            state: Mutex::new(FakeDataPlaneState {
                pgs_clean: true,
                ..Default::default()
            }),
        }
    }
}

impl FakeDataPlane {
    /// Create a new healthy instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the given closure over the locked state.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut FakeDataPlaneState) -> R) -> R {
        let mut state = self.state.lock().expect("fake data plane poisoned");
        f(&mut state)
    }
}

#[async_trait]
impl DataPlane for FakeDataPlane {
    async fn ok_to_stop(&self, id: i32, max: u32) -> Result<Vec<i32>, OkToStopError> {
        self.with_state(|state| {
            state.ok_to_stop_calls += 1;
            if state.unavailable_calls > 0 {
                state.unavailable_calls -= 1;
                return Err(OkToStopError::Unavailable(anyhow!("scripted ok-to-stop outage")));
            }
            if state.not_safe.contains(&id) {
                return Err(OkToStopError::NotSafe(id));
            }
            let mut batch = state.batches.get(&id).cloned().unwrap_or_else(|| vec![id]);
            batch.truncate(max as usize);
            Ok(batch)
        })
    }

    async fn pgs_clean(&self) -> Result<bool> {
        self.with_state(|state| Ok(state.pgs_clean))
    }

    async fn auth_rotate(&self, entity: &str) -> Result<()> {
        self.with_state(|state| {
            state.rotated.push(entity.to_string());
            Ok(())
        })
    }

    async fn osd_dump(&self) -> Result<Vec<OsdDumpEntry>> {
        self.with_state(|state| Ok(state.dump.clone()))
    }

    async fn crush_get_device_class(&self, id: i32) -> Result<String> {
        self.with_state(|state| Ok(state.device_classes.get(&id).cloned().unwrap_or_default()))
    }

    async fn versions(&self) -> Result<HashMap<String, u32>> {
        self.with_state(|state| {
            state.versions_calls += 1;
            Ok(state.versions.clone())
        })
    }
}
