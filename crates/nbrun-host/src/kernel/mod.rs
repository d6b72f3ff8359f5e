//! Kernels: transport channels, the message bridge and the kernel registry.

pub mod bridge;
pub mod process;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use nbrun_protocol::{KernelInfo, KernelMessage};
use parking_lot::RwLock;
use tokio::sync::mpsc;

pub use bridge::{ExecuteReply, Execution, KernelBridge, KernelEvent};
pub use process::ProcessKernel;

use crate::config::{HostConfig, KernelSpec};
use crate::error::RegistryError;
use crate::record::KernelId;

/// Host side of a kernel connection.
#[derive(Debug)]
pub struct KernelChannel {
    pub outbound: mpsc::UnboundedSender<KernelMessage>,
    pub inbound: mpsc::UnboundedReceiver<KernelMessage>,
}

/// Kernel side of a kernel connection.
#[derive(Debug)]
pub struct KernelEndpoint {
    pub incoming: mpsc::UnboundedReceiver<KernelMessage>,
    pub outgoing: mpsc::UnboundedSender<KernelMessage>,
}

impl KernelChannel {
    pub fn pair() -> (KernelChannel, KernelEndpoint) {
        let (to_kernel, incoming) = mpsc::unbounded_channel();
        let (outgoing, from_kernel) = mpsc::unbounded_channel();
        (
            KernelChannel {
                outbound: to_kernel,
                inbound: from_kernel,
            },
            KernelEndpoint { incoming, outgoing },
        )
    }
}

/// Lookup of live kernels, consumed by the execution stack.
pub trait KernelRegistry: Send + Sync {
    fn is_alive(&self, kernel_id: &KernelId) -> bool;
    fn bridge(&self, kernel_id: &KernelId) -> Option<Arc<KernelBridge>>;
}

struct ManagedKernel {
    name: String,
    bridge: Arc<KernelBridge>,
}

/// Owns every kernel connection of this host.
///
/// A kernel whose channel closed on its own stays listed with `alive: false`
/// until it is shut down.
pub struct KernelManager {
    specs: BTreeMap<String, KernelSpec>,
    kernels: RwLock<HashMap<KernelId, ManagedKernel>>,
    allow_stdin: bool,
}

impl KernelManager {
    pub fn new(specs: impl IntoIterator<Item = KernelSpec>, allow_stdin: bool) -> Self {
        Self {
            specs: specs
                .into_iter()
                .map(|spec| (spec.name.clone(), spec))
                .collect(),
            kernels: RwLock::default(),
            allow_stdin,
        }
    }

    pub fn from_config(config: &HostConfig) -> Self {
        Self::new(config.kernel_specs.iter().cloned(), config.allow_stdin)
    }

    /// Register an already-connected kernel under a fresh id.
    pub fn attach(&self, name: &str, channel: KernelChannel) -> KernelId {
        self.attach_as(KernelId::generate(), name, channel)
    }

    /// Register an already-connected kernel under `kernel_id`, closing any
    /// previous kernel with that id.
    pub fn attach_as(&self, kernel_id: KernelId, name: &str, channel: KernelChannel) -> KernelId {
        let bridge = KernelBridge::new(kernel_id.clone(), channel, self.allow_stdin);
        let kernel = ManagedKernel {
            name: name.to_string(),
            bridge: Arc::new(bridge),
        };
        let previous = self.kernels.write().insert(kernel_id.clone(), kernel);
        if let Some(previous) = previous {
            tracing::warn!(kernel = %kernel_id, "replacing attached kernel");
            previous.bridge.close();
        }
        tracing::info!(kernel = %kernel_id, name, "kernel attached");
        kernel_id
    }

    /// Launch a kernel process from a configured spec.
    pub fn start(&self, spec_name: &str) -> Result<KernelId, RegistryError> {
        let spec = self
            .specs
            .get(spec_name)
            .ok_or_else(|| RegistryError::UnknownSpec(spec_name.to_string()))?;
        let channel = ProcessKernel::spawn(spec)?;
        Ok(self.attach(spec_name, channel))
    }

    /// Close a kernel's channel and forget it.
    pub fn shutdown(&self, kernel_id: &KernelId) -> Result<(), RegistryError> {
        let kernel = self
            .kernels
            .write()
            .remove(kernel_id)
            .ok_or_else(|| RegistryError::UnknownKernel(kernel_id.clone()))?;
        kernel.bridge.close();
        tracing::info!(kernel = %kernel_id, "kernel shut down");
        Ok(())
    }

    pub fn shutdown_all(&self) {
        let kernels: Vec<_> = self.kernels.write().drain().collect();
        for (kernel_id, kernel) in kernels {
            kernel.bridge.close();
            tracing::info!(kernel = %kernel_id, "kernel shut down");
        }
    }

    pub fn list(&self) -> Vec<KernelInfo> {
        let mut infos: Vec<KernelInfo> = self
            .kernels
            .read()
            .iter()
            .map(|(id, kernel)| KernelInfo {
                id: id.to_string(),
                name: kernel.name.clone(),
                alive: !kernel.bridge.is_closed(),
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub fn info(&self, kernel_id: &KernelId) -> Option<KernelInfo> {
        self.kernels.read().get(kernel_id).map(|kernel| KernelInfo {
            id: kernel_id.to_string(),
            name: kernel.name.clone(),
            alive: !kernel.bridge.is_closed(),
        })
    }

    pub fn len(&self) -> usize {
        self.kernels.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KernelRegistry for KernelManager {
    fn is_alive(&self, kernel_id: &KernelId) -> bool {
        self.kernels
            .read()
            .get(kernel_id)
            .is_some_and(|kernel| !kernel.bridge.is_closed())
    }

    fn bridge(&self, kernel_id: &KernelId) -> Option<Arc<KernelBridge>> {
        self.kernels
            .read()
            .get(kernel_id)
            .map(|kernel| kernel.bridge.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn attached_kernel_is_alive_until_shutdown() {
        let manager = KernelManager::new([], true);
        let (channel, _endpoint) = KernelChannel::pair();
        let id = manager.attach("scripted", channel);
        assert!(manager.is_alive(&id));
        assert_eq!(manager.list()[0].name, "scripted");

        manager.shutdown(&id).unwrap();
        assert!(!manager.is_alive(&id));
        assert!(manager.bridge(&id).is_none());
        assert!(matches!(
            manager.shutdown(&id),
            Err(RegistryError::UnknownKernel(_))
        ));
    }

    #[tokio::test]
    async fn kernel_that_hangs_up_is_not_alive() {
        let manager = KernelManager::new([], true);
        let (channel, endpoint) = KernelChannel::pair();
        let id = manager.attach_as(KernelId::new("k1"), "scripted", channel);
        drop(endpoint);
        for _ in 0..100 {
            if !manager.is_alive(&id) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!manager.is_alive(&id));
        assert!(!manager.list()[0].alive);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exited_process_kernel_stays_listed_as_dead() {
        let spec = KernelSpec::from_command_line("short", "true").unwrap();
        let manager = KernelManager::new([spec], true);
        let id = manager.start("short").unwrap();
        for _ in 0..500 {
            if !manager.is_alive(&id) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let info = manager.info(&id).unwrap();
        assert!(!info.alive);
        assert_eq!(info.name, "short");

        manager.shutdown(&id).unwrap();
        assert!(manager.is_empty());
    }

    #[test]
    fn unknown_spec_is_rejected() {
        let manager = KernelManager::new([], true);
        assert!(matches!(
            manager.start("python"),
            Err(RegistryError::UnknownSpec(name)) if name == "python"
        ));
    }
}
