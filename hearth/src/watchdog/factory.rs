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

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::signature::short_hash;
use crate::module::{Module, ModuleIdentity};

type Constructor = Arc<dyn Fn(&ModuleIdentity) -> Arc<dyn Module> + Send + Sync>;

struct Registration {
    constructor: Constructor,
    build: String,
}

/// Maps implementation names to module constructors.
///
/// The supervisor resolves every entry of its module list through this
/// table, by file name.
///
/// ```rust,ignore
/// let mut factory = ModuleFactory::new();
/// factory.register("temp", |_identity| Thermometer::default());
/// ```
#[derive(Default)]
pub struct ModuleFactory {
    registrations: HashMap<String, Registration>,
}

impl fmt::Debug for ModuleFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut files: Vec<_> = self.registrations.keys().collect();
        files.sort();
        f.debug_struct("ModuleFactory").field("files", &files).finish()
    }
}

impl ModuleFactory {
    /// Creates an empty factory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `constructor` under `file`, replacing any previous one.
    ///
    /// The build identifier of the module is derived from its type and the
    /// crate version.
    pub fn register<M, F>(&mut self, file: impl Into<String>, constructor: F) -> &mut Self
    where
        M: Module,
        F: Fn(&ModuleIdentity) -> M + Send + Sync + 'static,
    {
        let file = file.into();
        let build = short_hash(&format!(
            "{}@{}",
            std::any::type_name::<M>(),
            env!("CARGO_PKG_VERSION")
        ));
        let constructor: Constructor =
            Arc::new(move |identity| Arc::new(constructor(identity)) as Arc<dyn Module>);
        self.registrations
            .insert(file, Registration { constructor, build });
        self
    }

    /// Returns `true` if `file` can be instantiated.
    #[must_use]
    pub fn contains(&self, file: &str) -> bool {
        self.registrations.contains_key(file)
    }

    /// Instantiates `file` for `identity`, with its build identifier.
    #[must_use]
    pub fn create(&self, file: &str, identity: &ModuleIdentity) -> Option<(Arc<dyn Module>, String)> {
        self.registrations
            .get(file)
            .map(|registration| ((registration.constructor)(identity), registration.build.clone()))
    }
}
