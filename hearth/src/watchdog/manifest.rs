/*
 * Copyright (c) 2024. Govcraft
 *
 * Licensed under either of
 *   * Apache License, Version 2.0 (the "License");
 *     you may not use this file except in compliance with the License.
 *     You may obtain a copy of the License at http://www.apache.org/licenses/LICENSE-2.0
 *   * MIT license: http://opensource.org/licenses/MIT
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the applicable License for the specific language governing permissions and
 * limitations under that License.
 */

use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use super::registry::ModuleEntry;

/// Manifest schema this SDK understands.
pub const SUPPORTED_SCHEMA: u64 = 2;

/// Keys every manifest must carry.
pub const REQUIRED_KEYS: [&str; 8] = [
    "manifest_schema",
    "package",
    "revision",
    "version",
    "branch",
    "github",
    "dockerhub",
    "modules",
];

/// Why a manifest could not be loaded. Every variant is fatal for the supervisor.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The file does not exist.
    #[error("manifest not found at {0}, refusing to start")]
    NotFound(PathBuf),
    /// The file could not be read.
    #[error("unable to read manifest {path}: {source}")]
    Io {
        /// Manifest path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid YAML, or not a map.
    #[error("invalid manifest file in {path}: {reason}")]
    Invalid {
        /// Manifest path.
        path: PathBuf,
        /// Parser message.
        reason: String,
    },
    /// The schema version is not [`SUPPORTED_SCHEMA`].
    #[error("unsupported manifest schema v{0}")]
    UnsupportedSchema(String),
    /// A required key is absent.
    #[error("{0} is missing from manifest")]
    MissingKey(&'static str),
    /// The package needs a newer SDK.
    #[error("package requires SDK {required} but {available} is installed")]
    SdkTooOld {
        /// `min_sdk_version` of the package.
        required: String,
        /// Version of this SDK.
        available: String,
    },
}

/// A package's self-description, as published on the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    document: Map<String, Value>,
}

impl Manifest {
    /// Loads and validates the manifest at `path`.
    ///
    /// `sdk_manifest` is the SDK's own manifest, whose `version` is compared to
    /// the package's `min_sdk_version`; when it cannot be read the crate
    /// version is used instead. Module declarations are renamed after the
    /// aliases in `entries` before the default configuration under
    /// `default_config` is embedded.
    ///
    /// # Errors
    ///
    /// Returns a [`ManifestError`] if the manifest is missing, malformed,
    /// incomplete or requires a newer SDK.
    pub fn load(
        path: &Path,
        sdk_manifest: &Path,
        default_config: &Path,
        entries: &[ModuleEntry],
    ) -> Result<Self, ManifestError> {
        if !path.is_file() {
            return Err(ManifestError::NotFound(path.to_path_buf()));
        }
        let content = fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut manifest = Self::parse(&content).map_err(|e| match e {
            ManifestError::Invalid { reason, .. } => ManifestError::Invalid {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })?;
        manifest.check_sdk_version(&sdk_version(sdk_manifest))?;
        manifest.apply_aliases(entries);
        let bundle = load_default_config(default_config, entries);
        manifest
            .document
            .insert("default_config".to_string(), Value::Array(bundle));
        Ok(manifest)
    }

    /// Parses and validates a manifest document.
    ///
    /// # Errors
    ///
    /// See [`Manifest::load`].
    pub fn parse(content: &str) -> Result<Self, ManifestError> {
        let invalid = |reason: String| ManifestError::Invalid {
            path: PathBuf::new(),
            reason,
        };
        let value: Value = serde_yaml::from_str(content).map_err(|e| invalid(e.to_string()))?;
        let Value::Object(document) = value else {
            return Err(invalid("not a map".to_string()));
        };
        match document.get("manifest_schema") {
            Some(schema) if schema.as_u64() == Some(SUPPORTED_SCHEMA) => {}
            Some(schema) => return Err(ManifestError::UnsupportedSchema(scalar(schema))),
            None => return Err(ManifestError::MissingKey("manifest_schema")),
        }
        if let Some(missing) = REQUIRED_KEYS.iter().find(|key| !document.contains_key(**key)) {
            return Err(ManifestError::MissingKey(*missing));
        }
        Ok(Self { document })
    }

    /// Package name.
    #[must_use]
    pub fn package(&self) -> String {
        self.field("package")
    }

    /// `version-revision (branch)`, stamped on every started module.
    #[must_use]
    pub fn version_string(&self) -> String {
        format!(
            "{}-{} ({})",
            self.field("version"),
            self.field("revision"),
            self.field("branch")
        )
    }

    /// `min_sdk_version`, if the package declares one.
    #[must_use]
    pub fn min_sdk_version(&self) -> Option<String> {
        self.document.get("min_sdk_version").map(scalar)
    }

    /// Names of the modules the package declares.
    #[must_use]
    pub fn module_names(&self) -> Vec<String> {
        self.modules()
            .map(|modules| modules.iter().filter_map(declaration_name).collect())
            .unwrap_or_default()
    }

    /// Fails if this SDK is older than the package's `min_sdk_version`.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::SdkTooOld`].
    pub fn check_sdk_version(&self, available: &str) -> Result<(), ManifestError> {
        match self.min_sdk_version() {
            Some(required) if compare_versions(available, &required) == Ordering::Less => {
                Err(ManifestError::SdkTooOld {
                    required,
                    available: available.to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Renames module declarations `package/file` to `package/alias`.
    pub fn apply_aliases(&mut self, entries: &[ModuleEntry]) {
        let Some(Value::Array(modules)) = self.document.get_mut("modules") else {
            return;
        };
        for entry in entries.iter().filter(|entry| entry.is_aliased()) {
            let declared = entry.declared_name();
            for declaration in modules.iter_mut() {
                match declaration {
                    Value::Object(map) => {
                        if let Some(body) = map.remove(&declared) {
                            map.insert(entry.fullname.clone(), body);
                        }
                    }
                    Value::String(name) if *name == declared => {
                        *name = entry.fullname.clone();
                    }
                    _ => {}
                }
            }
        }
    }

    /// The document published with the `MANIFEST` command.
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Object(self.document.clone())
    }

    fn modules(&self) -> Option<&Vec<Value>> {
        self.document.get("modules")?.as_array()
    }

    fn field(&self, key: &str) -> String {
        self.document.get(key).map(scalar).unwrap_or_default()
    }
}

// Versions and revisions are written as numbers or strings in the wild.
fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn declaration_name(declaration: &Value) -> Option<String> {
    match declaration {
        Value::String(name) => Some(name.clone()),
        Value::Object(map) => map.keys().next().cloned(),
        _ => None,
    }
}

/// Compares dotted numeric versions; missing or non-numeric parts count as 0.
#[must_use]
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parts = |v: &str| -> Vec<u64> {
        v.trim()
            .split('.')
            .map(|part| {
                part.chars()
                    .take_while(char::is_ascii_digit)
                    .collect::<String>()
                    .parse()
                    .unwrap_or(0)
            })
            .collect()
    };
    let (a, b) = (parts(a), parts(b));
    let len = a.len().max(b.len());
    for i in 0..len {
        let ordering = a.get(i).copied().unwrap_or(0).cmp(&b.get(i).copied().unwrap_or(0));
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn sdk_version(sdk_manifest: &Path) -> String {
    let from_file = fs::read_to_string(sdk_manifest)
        .ok()
        .and_then(|content| serde_yaml::from_str::<Value>(&content).ok())
        .and_then(|manifest| manifest.get("version").map(scalar));
    from_file.unwrap_or_else(|| {
        debug!(
            "SDK manifest {} unavailable, using crate version",
            sdk_manifest.display()
        );
        env!("CARGO_PKG_VERSION").to_string()
    })
}

/// Walks `directory` and parses every `.yml` file into `{topic: content}`,
/// the topic being the file's path relative to `directory` without extension.
///
/// Topics under an aliased module's declared name are filed under the alias.
/// Hidden files and invalid documents are skipped, the latter with a warning.
#[must_use]
pub fn load_default_config(directory: &Path, entries: &[ModuleEntry]) -> Vec<Value> {
    let mut files = Vec::new();
    collect_yaml_files(directory, &mut files);
    files.sort();

    let mut bundle = Vec::new();
    for file in files {
        let Ok(relative) = file.strip_prefix(directory) else {
            continue;
        };
        let mut topic = relative
            .with_extension("")
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        for entry in entries.iter().filter(|entry| entry.is_aliased()) {
            let declared = entry.declared_name();
            if topic == declared || topic.starts_with(&format!("{declared}/")) {
                topic = format!("{}{}", entry.fullname, &topic[declared.len()..]);
            }
        }
        let content = match fs::read_to_string(&file) {
            Ok(content) => content,
            Err(e) => {
                warn!("unable to read configuration file {}: {e}", file.display());
                continue;
            }
        };
        match serde_yaml::from_str::<Value>(&content) {
            Ok(value) => {
                let mut entry = Map::new();
                entry.insert(topic, value);
                bundle.push(Value::Object(entry));
            }
            Err(e) => warn!(
                "configuration file in an invalid YAML format: {} - {e}",
                file.display()
            ),
        }
    }
    bundle
}

fn collect_yaml_files(directory: &Path, files: &mut Vec<PathBuf>) {
    let Ok(read_dir) = fs::read_dir(directory) else {
        return;
    };
    for dir_entry in read_dir.flatten() {
        let path = dir_entry.path();
        let hidden = path
            .file_name()
            .is_some_and(|name| name.to_string_lossy().starts_with('.'));
        if hidden {
            continue;
        }
        if path.is_dir() {
            collect_yaml_files(&path, files);
        } else if path.extension().is_some_and(|ext| ext == "yml") {
            files.push(path);
        }
    }
}
