//
// kernel_spec.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
// Licensed under the Elastic License 2.0. See LICENSE.txt for license information.
//
//

//! Kernelspec lookup: how to launch a kernel of a given name.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

pub use kgshared::kernel_model::KernelSpec;
use kgshared::kernel_model::KernelSpecModel;

use crate::error::KSError;

/// Resource files served alongside a kernelspec, besides its logos
const STATIC_RESOURCES: [&str; 2] = ["kernel.js", "kernel.css"];

/// Resolves kernelspec names to kernelspecs.
pub trait KernelSpecProvider: Send + Sync {
    /// Look up a kernelspec by name.
    fn get(&self, name: &str) -> Result<KernelSpec, KSError>;

    /// The names of every available kernelspec, sorted.
    fn names(&self) -> Vec<String>;
}

/// Reads kernelspecs from `<dir>/<name>/kernel.json` in a list of directories.
/// The first directory holding a kernelspec of a given name wins.
pub struct KernelSpecDirectory {
    dirs: Vec<PathBuf>,
}

impl KernelSpecDirectory {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }

    /// Search the given directories first, then the standard Jupyter data
    /// directories.
    pub fn with_defaults(extra: Vec<PathBuf>) -> Self {
        let mut dirs = extra;
        dirs.extend(default_kernel_dirs());
        Self::new(dirs)
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    fn read_spec(resource_dir: &Path) -> Result<KernelSpec, anyhow::Error> {
        let file = File::open(resource_dir.join("kernel.json"))?;
        let mut spec: KernelSpec = serde_json::from_reader(BufReader::new(file))?;
        spec.resource_dir = resource_dir.to_path_buf();
        Ok(spec)
    }
}

impl KernelSpecProvider for KernelSpecDirectory {
    fn get(&self, name: &str) -> Result<KernelSpec, KSError> {
        for dir in &self.dirs {
            let resource_dir = dir.join(name);
            if !resource_dir.join("kernel.json").is_file() {
                continue;
            }
            match Self::read_spec(&resource_dir) {
                Ok(spec) => {
                    log::debug!("Loaded kernelspec '{}' from {:?}", name, resource_dir);
                    return Ok(spec);
                }
                Err(e) => {
                    log::warn!(
                        "Ignoring invalid kernelspec at {:?}: {}",
                        resource_dir,
                        e
                    );
                }
            }
        }
        Err(KSError::KernelSpecNotFound(name.to_string()))
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for dir in &self.dirs {
            let entries = match std::fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                if !entry.path().join("kernel.json").is_file() {
                    continue;
                }
                if let Some(name) = entry.file_name().to_str() {
                    if !names.iter().any(|n| n == name) {
                        names.push(name.to_string());
                    }
                }
            }
        }
        names.sort();
        names
    }
}

/// The standard places Jupyter installs kernelspecs: each entry of
/// `JUPYTER_PATH`, the user's data directory, then the system prefixes.
pub fn default_kernel_dirs() -> Vec<PathBuf> {
    let mut kernel_dirs: Vec<PathBuf> = Vec::new();
    if let Some(jupyter_path) = std::env::var_os("JUPYTER_PATH") {
        kernel_dirs.extend(std::env::split_paths(&jupyter_path).map(|p| p.join("kernels")));
    }
    if let Some(data_dir) = dirs::data_dir() {
        kernel_dirs.push(data_dir.join("jupyter").join("kernels"));
    }
    if let Some(home) = dirs::home_dir() {
        kernel_dirs.push(home.join(".local").join("share").join("jupyter").join("kernels"));
    }
    kernel_dirs.push(PathBuf::from("/usr/local/share/jupyter/kernels"));
    kernel_dirs.push(PathBuf::from("/usr/share/jupyter/kernels"));
    kernel_dirs.dedup();
    kernel_dirs
}

/// The API view of a kernelspec: the spec and links to the resource files in
/// its directory.
pub fn kernel_spec_model(name: &str, spec: KernelSpec) -> KernelSpecModel {
    let mut resources = BTreeMap::new();
    if let Ok(entries) = std::fs::read_dir(&spec.resource_dir) {
        for entry in entries.flatten() {
            if !entry.path().is_file() {
                continue;
            }
            let file_name = match entry.file_name().to_str() {
                Some(file_name) => file_name.to_string(),
                None => continue,
            };
            let key = if STATIC_RESOURCES.contains(&file_name.as_str()) {
                file_name.clone()
            } else if file_name.starts_with("logo-") {
                match Path::new(&file_name).file_stem().and_then(|stem| stem.to_str()) {
                    Some(stem) => stem.to_string(),
                    None => continue,
                }
            } else {
                continue;
            };
            resources.insert(key, format!("/kernelspecs/{}/{}", name, file_name));
        }
    }

    KernelSpecModel {
        name: name.to_string(),
        spec,
        resources,
    }
}

/// The path of a resource file in a kernelspec's directory. Only plain file
/// names inside the directory are served.
pub fn resource_path(spec: &KernelSpec, resource: &str) -> Option<PathBuf> {
    if spec.resource_dir.as_os_str().is_empty()
        || resource.is_empty()
        || resource.starts_with('.')
        || resource.contains(['/', '\\'])
    {
        return None;
    }
    let path = spec.resource_dir.join(resource);
    path.is_file().then_some(path)
}
