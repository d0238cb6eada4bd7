use rstest::rstest;

use crate::config::{
    ConfigurationError, LikelihoodConfig, LikelihoodConfigBuilder, RescalingScheme,
    ResourceSelection, DEFAULT_EXTRA_BUFFER_COUNT, DEFAULT_RESCALING_FREQUENCY,
};

#[rstest]
#[case("none", RescalingScheme::None)]
#[case("ALWAYS", RescalingScheme::Always)]
#[case("Dynamic", RescalingScheme::Dynamic)]
#[case(" delayed ", RescalingScheme::Delayed)]
#[case("auto", RescalingScheme::Auto)]
#[case("default", RescalingScheme::Default)]
fn rescaling_scheme_from_str(#[case] input: &str, #[case] expected: RescalingScheme) {
    assert_eq!(input.parse::<RescalingScheme>().unwrap(), expected);
}

#[test]
fn rescaling_scheme_display_round_trip() {
    for scheme in [
        RescalingScheme::None,
        RescalingScheme::Always,
        RescalingScheme::Dynamic,
        RescalingScheme::Delayed,
        RescalingScheme::Auto,
    ] {
        assert_eq!(scheme.to_string().parse::<RescalingScheme>().unwrap(), scheme);
    }
}

#[test]
fn unknown_rescaling_scheme() {
    let res = "sometimes".parse::<RescalingScheme>();
    assert!(res.is_err());
    assert!(res
        .unwrap_err()
        .downcast_ref::<ConfigurationError>()
        .is_some());
}

#[test]
fn builder_defaults() {
    let config = LikelihoodConfigBuilder::new().build();
    assert_eq!(config, LikelihoodConfig::default());
    assert_eq!(config.rescaling, RescalingScheme::Dynamic);
    assert_eq!(config.rescaling_frequency, DEFAULT_RESCALING_FREQUENCY);
    assert!(config.delay_rescaling_until_underflow);
    assert!(!config.use_ambiguities);
    assert_eq!(config.resource.first(), 0);
    assert_eq!(config.extra_buffer_count, DEFAULT_EXTRA_BUFFER_COUNT);
}

#[test]
fn default_scheme_resolves_to_dynamic() {
    let config = LikelihoodConfigBuilder::new()
        .rescaling(RescalingScheme::Default)
        .build();
    assert_eq!(config.rescaling, RescalingScheme::Dynamic);
}

#[test]
fn delayed_forces_delay() {
    let config = LikelihoodConfigBuilder::new()
        .rescaling(RescalingScheme::Delayed)
        .delay_rescaling_until_underflow(false)
        .build();
    assert!(config.delay_rescaling_until_underflow);
    let config = LikelihoodConfigBuilder::new()
        .rescaling(RescalingScheme::Always)
        .delay_rescaling_until_underflow(false)
        .build();
    assert!(!config.delay_rescaling_until_underflow);
}

#[test]
fn zero_frequency_falls_back() {
    let config = LikelihoodConfigBuilder::new().rescaling_frequency(0).build();
    assert_eq!(config.rescaling_frequency, DEFAULT_RESCALING_FREQUENCY);
    let config = LikelihoodConfigBuilder::new().rescaling_frequency(7).build();
    assert_eq!(config.rescaling_frequency, 7);
}

#[test]
fn resource_selection() {
    let config = LikelihoodConfigBuilder::new()
        .resource(ResourceSelection {
            preferred: vec![2, 0],
        })
        .use_ambiguities(true)
        .extra_buffer_count(4)
        .build();
    assert_eq!(config.resource.first(), 2);
    assert!(config.use_ambiguities);
    assert_eq!(config.extra_buffer_count, 4);
    assert_eq!(ResourceSelection::default().first(), 0);
}
