//! Host Capability Probing
//!
//! Decides once per process whether the kernel supports per-domain VRF
//! devices. Every failure mode fails closed to `NativeUnavailable`.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::kernel::{KernelDriver, KernelErrorKind};
use crate::model::IsolationMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    NativeAvailable,
    NativeUnavailable,
}

impl Capability {
    /// Isolation mode this capability selects
    pub fn isolation_mode(&self) -> IsolationMode {
        match self {
            Capability::NativeAvailable => IsolationMode::Native,
            Capability::NativeUnavailable => IsolationMode::Fallback,
        }
    }
}

#[async_trait]
pub trait CapabilityProber: Send + Sync {
    async fn probe(&self) -> Capability;
}

/// Probes by creating and deleting a throwaway VRF device
pub struct KernelProber {
    kernel: Arc<dyn KernelDriver>,
    device: String,
    table: u32,
}

impl KernelProber {
    pub fn new(kernel: Arc<dyn KernelDriver>, device: impl Into<String>, table: u32) -> Self {
        Self {
            kernel,
            device: device.into(),
            table,
        }
    }
}

#[async_trait]
impl CapabilityProber for KernelProber {
    async fn probe(&self) -> Capability {
        // Leftover from an interrupted probe
        let _ = self.kernel.delete_link(&self.device).await;

        match self.kernel.create_vrf(&self.device, self.table).await {
            Ok(()) => {
                if let Err(e) = self.kernel.delete_link(&self.device).await {
                    warn!(device = %self.device, error = %e, "Failed to remove probe device");
                }
                info!("VRF devices supported, using native isolation");
                Capability::NativeAvailable
            }
            Err(e) if e.kind() == KernelErrorKind::NotSupported => {
                info!(error = %e, "VRF devices not supported, using fallback isolation");
                Capability::NativeUnavailable
            }
            Err(e) => {
                warn!(error = %e, "VRF probe failed, using fallback isolation");
                Capability::NativeUnavailable
            }
        }
    }
}

/// Process-wide capability, resolved at most once
pub struct CapabilityState {
    prober: Option<Arc<dyn CapabilityProber>>,
    cell: OnceCell<Capability>,
}

impl CapabilityState {
    pub fn new(prober: Arc<dyn CapabilityProber>) -> Self {
        Self {
            prober: Some(prober),
            cell: OnceCell::new(),
        }
    }

    /// Already resolved; never probes
    pub fn preset(capability: Capability) -> Self {
        Self {
            prober: None,
            cell: OnceCell::new_with(Some(capability)),
        }
    }

    /// Resolve the capability; concurrent callers share one probe
    pub async fn resolve(&self) -> Capability {
        *self
            .cell
            .get_or_init(|| async {
                match &self.prober {
                    Some(prober) => prober.probe().await,
                    None => Capability::NativeUnavailable,
                }
            })
            .await
    }

    pub fn get(&self) -> Option<Capability> {
        self.cell.get().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedKernel;

    fn state_for(node: &Arc<SimulatedKernel>) -> Arc<CapabilityState> {
        let prober = KernelProber::new(node.clone(), "vrf-probe", 9999);
        Arc::new(CapabilityState::new(Arc::new(prober)))
    }

    #[tokio::test]
    async fn test_native_available() {
        let node = Arc::new(SimulatedKernel::new());
        let state = state_for(&node);
        assert_eq!(state.get(), None);
        assert_eq!(state.resolve().await, Capability::NativeAvailable);
        assert!(node.link("vrf-probe").is_none());
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_probe() {
        let node = Arc::new(SimulatedKernel::without_vrf());
        let state = state_for(&node);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let state = state.clone();
            handles.push(tokio::spawn(async move { state.resolve().await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), Capability::NativeUnavailable);
        }
        assert_eq!(state.resolve().await, Capability::NativeUnavailable);
        assert_eq!(node.vrf_create_attempts(), 1);
    }

    #[tokio::test]
    async fn test_other_failures_fail_closed() {
        let node = Arc::new(SimulatedKernel::new());
        // stale-probe cleanup and the create both hit a busy lock
        node.fail_next_mutations(2);
        let state = state_for(&node);
        assert_eq!(state.resolve().await, Capability::NativeUnavailable);
    }

    #[tokio::test]
    async fn test_preset_never_probes() {
        let state = CapabilityState::preset(Capability::NativeAvailable);
        assert_eq!(state.get(), Some(Capability::NativeAvailable));
        assert_eq!(state.resolve().await.isolation_mode(), IsolationMode::Native);
    }
}
