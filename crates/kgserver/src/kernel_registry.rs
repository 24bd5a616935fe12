//
// kernel_registry.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
// Licensed under the Elastic License 2.0. See LICENSE.txt for license information.
//
//

//! The table of kernels the gateway is running.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use kgshared::kernel_model::{KernelModel, KernelSpecList, KernelSpecModel};

use crate::{
    config::GatewayConfig,
    error::KSError,
    kernel_manager::KernelManager,
    kernel_spec::{kernel_spec_model, KernelSpec, KernelSpecDirectory, KernelSpecProvider},
    port_allocator::PortAllocator,
    process_controller::{LocalProcessController, ProcessController},
};

/// Owns every kernel the gateway has started, keyed by kernel ID.
pub struct KernelRegistry {
    kernels: Mutex<HashMap<String, Arc<KernelManager>>>,
    config: Arc<GatewayConfig>,
    ports: Arc<PortAllocator>,
    specs: Arc<dyn KernelSpecProvider>,
    processes: Arc<dyn ProcessController>,
    cleaned_up: AtomicBool,
}

impl KernelRegistry {
    pub fn new(
        config: GatewayConfig,
        specs: Arc<dyn KernelSpecProvider>,
        processes: Arc<dyn ProcessController>,
    ) -> Self {
        let ports = PortAllocator::new(config.ip, config.port_range.clone(), config.port_attempts);
        Self {
            kernels: Mutex::new(HashMap::new()),
            config: Arc::new(config),
            ports: Arc::new(ports),
            specs,
            processes,
            cleaned_up: AtomicBool::new(false),
        }
    }

    /// A registry that launches local processes from kernelspecs found in the
    /// configured and standard Jupyter directories.
    pub fn with_defaults(config: GatewayConfig) -> Self {
        let specs = KernelSpecDirectory::with_defaults(config.kernel_spec_dirs.clone());
        log::debug!("Searching for kernelspecs in {:?}", specs.dirs());
        Self::new(config, Arc::new(specs), Arc::new(LocalProcessController::new()))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<KernelManager>>> {
        match self.kernels.lock() {
            Ok(kernels) => kernels,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    /// Look up a kernelspec by name.
    pub fn kernel_spec(&self, name: &str) -> Result<KernelSpec, KSError> {
        self.specs.get(name)
    }

    /// The API view of one kernelspec.
    pub fn kernel_spec_model(&self, name: &str) -> Result<KernelSpecModel, KSError> {
        Ok(kernel_spec_model(name, self.specs.get(name)?))
    }

    /// Every kernelspec that can be read. Kernelspecs that fail to load are
    /// logged and left out.
    pub fn kernel_specs(&self) -> KernelSpecList {
        let mut kernelspecs = std::collections::BTreeMap::new();
        for name in self.specs.names() {
            match self.kernel_spec_model(&name) {
                Ok(model) => {
                    kernelspecs.insert(name, model);
                }
                Err(err) => err.log(),
            }
        }
        KernelSpecList {
            default: self.config.default_kernel.clone(),
            kernelspecs,
        }
    }

    /// Start a kernel from the named kernelspec and return its ID. The kernel
    /// is only added to the registry if it starts.
    pub async fn start(&self, name: &str) -> Result<String, KSError> {
        let kernel_id = uuid::Uuid::new_v4().to_string();
        let manager = KernelManager::new(
            kernel_id.clone(),
            name.to_string(),
            self.config.clone(),
            self.ports.clone(),
            self.specs.clone(),
            self.processes.clone(),
        )
        .map_err(KSError::ProcessLaunch)?;

        manager.start().await?;

        self.lock().insert(kernel_id.clone(), Arc::new(manager));
        log::info!("[kernel {}] Registered kernel '{}'", kernel_id, name);
        Ok(kernel_id)
    }

    pub fn get(&self, kernel_id: &str) -> Result<Arc<KernelManager>, KSError> {
        self.lock()
            .get(kernel_id)
            .cloned()
            .ok_or_else(|| KSError::NotFound(kernel_id.to_string()))
    }

    /// A snapshot of every kernel, sorted by ID.
    pub async fn list(&self) -> Vec<KernelModel> {
        let mut kernels: Vec<Arc<KernelManager>> = self.lock().values().cloned().collect();
        kernels.sort_by(|a, b| a.kernel_id.cmp(&b.kernel_id));

        let mut models = Vec::with_capacity(kernels.len());
        for kernel in kernels {
            models.push(kernel.to_model().await);
        }
        models
    }

    /// Stop a kernel and remove it from the registry.
    pub async fn kill(&self, kernel_id: &str) -> Result<(), KSError> {
        let kernel = self
            .lock()
            .remove(kernel_id)
            .ok_or_else(|| KSError::NotFound(kernel_id.to_string()))?;

        log::info!("[kernel {}] Killing kernel", kernel_id);
        kernel.stop().await
    }

    /// Stop every kernel. Only the first call does anything; it is meant to
    /// run once, as the gateway shuts down.
    pub async fn cleanup(&self) {
        if self.cleaned_up.swap(true, Ordering::SeqCst) {
            return;
        }

        let kernels: Vec<Arc<KernelManager>> = self.lock().drain().map(|(_, k)| k).collect();
        log::info!("Shutting down {} kernel(s)", kernels.len());
        for kernel in kernels {
            if let Err(err) = kernel.stop().await {
                log::warn!("[kernel {}] {}", kernel.kernel_id, err);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
