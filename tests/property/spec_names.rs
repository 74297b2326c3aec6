use std::collections::HashSet;

use gangway::spec::{
    BuildMeta, EnvVar, ExecutionProfile, SpecBuilder, SpecDefaults, merge_env,
};
use proptest::prelude::*;

fn env_strategy() -> impl Strategy<Value = Vec<EnvVar>> {
    // Small name alphabet so collisions with each other and with the base
    // entries actually happen.
    proptest::collection::vec(
        (
            prop_oneof![
                Just("SSL_CERT_FILE".to_string()),
                "[A-C]{1,2}".prop_map(String::from),
            ],
            "[a-z0-9]{0,4}",
        )
            .prop_map(|(name, value)| EnvVar::new(name, value)),
        0..8,
    )
}

proptest! {
    #[test]
    fn unit_name_is_derived_from_build_and_index(
        build in "[a-z][a-z0-9]{0,15}",
        number in 1u32..100_000,
        index in 0u32..64,
    ) {
        let meta = BuildMeta {
            build_config: build.clone(),
            build_number: number.to_string(),
            image: "img".to_string(),
            ..Default::default()
        };
        let spec = SpecBuilder::new(SpecDefaults::default(), ExecutionProfile::modern())
            .build(&meta, index, &[])
            .unwrap();

        prop_assert_eq!(spec.name, format!("{build}-{number}-worker-{index}"));
    }

    #[test]
    fn merged_env_has_unique_names_and_last_value_wins(
        base in env_strategy(),
        caller in env_strategy(),
    ) {
        let merged = merge_env(&base, &caller);

        let mut seen = HashSet::new();
        for var in &merged {
            prop_assert!(seen.insert(var.name.clone()), "duplicate {}", var.name);
        }

        for var in &merged {
            let last = base
                .iter()
                .chain(&caller)
                .filter(|e| e.name == var.name)
                .last()
                .unwrap();
            prop_assert_eq!(&var.value, &last.value);
        }
        prop_assert_eq!(
            seen,
            base.iter().chain(&caller).map(|e| e.name.clone()).collect::<HashSet<_>>()
        );
    }
}
