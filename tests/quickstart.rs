use std::path::Path;

use kpatch_ci::config::PipelineConfig;
use kpatch_ci::stages;
use kpatch_ci::validation::validate_config;

#[test]
fn example_config_is_valid() {
    let config = PipelineConfig::load(Path::new("configs/kpatch-ci.example.yaml"))
        .expect("example config should load");
    let report = validate_config(&config, &stages::default_registry());
    assert!(
        report.is_ok(),
        "example config should pass validation: {:?}",
        report.errors
    );
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);
}
