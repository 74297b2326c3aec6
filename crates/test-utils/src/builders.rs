#![allow(dead_code)]

use std::collections::BTreeMap;

use gangway::spec::{BuildMeta, EnvVar, ExecutionProfile, SpecBuilder, SpecDefaults, UnitSpec};

/// Builder for `BuildMeta` with valid defaults (`b1`, build `5`).
pub struct BuildMetaBuilder {
    meta: BuildMeta,
}

impl BuildMetaBuilder {
    pub fn new() -> Self {
        Self {
            meta: BuildMeta {
                build_config: "b1".to_string(),
                build_number: "5".to_string(),
                image: "quay.io/example/builder:latest".to_string(),
                service_account: None,
                labels: BTreeMap::new(),
            },
        }
    }

    pub fn build_config(mut self, name: &str) -> Self {
        self.meta.build_config = name.to_string();
        self
    }

    pub fn build_number(mut self, number: &str) -> Self {
        self.meta.build_number = number.to_string();
        self
    }

    pub fn image(mut self, image: &str) -> Self {
        self.meta.image = image.to_string();
        self
    }

    pub fn service_account(mut self, sa: &str) -> Self {
        self.meta.service_account = Some(sa.to_string());
        self
    }

    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.meta.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn build(self) -> BuildMeta {
        self.meta
    }
}

impl Default for BuildMetaBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Unit spec for worker `index` of the default build under `profile`.
pub fn unit_spec(profile: ExecutionProfile, index: u32, env: &[EnvVar]) -> UnitSpec {
    SpecBuilder::new(SpecDefaults::default(), profile)
        .build(&BuildMetaBuilder::new().build(), index, env)
        .expect("Failed to build unit spec from valid metadata")
}
