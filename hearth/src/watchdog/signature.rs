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

use sha2::{Digest, Sha256};

use crate::common::Settings;

/// Short hex digest of `input`, used for build identifiers and signatures.
#[must_use]
pub fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut encoded = hex::encode(digest);
    encoded.truncate(7);
    encoded
}

/// Stable digest of the runtime parameters that distinguish two supervisors
/// of the same package: gateway endpoint and transport, and the house id.
/// Credentials are not part of it.
#[must_use]
pub fn runtime_signature(settings: &Settings) -> String {
    short_hash(&format!(
        "{}|{}|{}|{}|{}",
        settings.gateway_hostname,
        settings.gateway_port,
        settings.gateway_transport,
        settings.gateway_ssl,
        settings.house_id
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_ignores_the_passcode() {
        let a = Settings::local("house");
        let b = Settings {
            house_passcode: "secret".to_string(),
            ..Settings::local("house")
        };
        assert_eq!(runtime_signature(&a), runtime_signature(&b));
        assert_eq!(runtime_signature(&a).len(), 7);
    }

    #[test]
    fn signature_tracks_house_and_gateway() {
        let base = Settings::local("house");
        let other_house = Settings::local("other");
        let other_port = Settings {
            gateway_port: 8883,
            ..Settings::local("house")
        };
        assert_ne!(runtime_signature(&base), runtime_signature(&other_house));
        assert_ne!(runtime_signature(&base), runtime_signature(&other_port));
    }
}
