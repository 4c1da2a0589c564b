use serde::Serialize;

use crate::config::{DeliveryKind, PipelineConfig, PublisherKind};
use crate::pipeline::{StageKind, StageRegistry};
use crate::template::{self, TemplateVars};

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

/// Check a configuration before any stage touches a tree or the lab.
pub fn validate_config(config: &PipelineConfig, registry: &StageRegistry) -> ValidationReport {
    let mut report = ValidationReport::default();

    for kind in StageKind::ALL {
        if let Err(err) = registry.create(kind, config) {
            report.errors.push(format!("{kind}: {err}"));
        }
    }
    report.merge(validate_merge(config));
    report.merge(validate_publish(config));
    report.merge(validate_run(config));
    report.merge(validate_report(config));
    report.merge(validate_bisect(config));
    report
}

fn validate_merge(config: &PipelineConfig) -> ValidationReport {
    let mut report = ValidationReport::default();
    if config.merge.baserepo.as_deref().is_none_or(|repo| repo.trim().is_empty()) {
        report
            .errors
            .push("merge.baserepo is required".into());
    }
    if config.merge.reference.trim().is_empty() {
        report.errors.push("merge.ref cannot be empty".into());
    }
    for patch in &config.merge.patches {
        if patch.trim().is_empty() {
            report
                .errors
                .push("merge.patches cannot contain empty entries".into());
        }
    }
    if config.merge.fetch_depth == Some(0) {
        report
            .errors
            .push("merge.fetch_depth must be at least 1".into());
    }
    report
}

fn validate_publish(config: &PipelineConfig) -> ValidationReport {
    let mut report = ValidationReport::default();
    let settings = &config.publish;
    match settings.destination.as_deref() {
        None => report
            .warnings
            .push("publish.destination is not set; publish will refuse to run".into()),
        Some(dest) if settings.kind == PublisherKind::Scp && !dest.contains(':') => {
            report.warnings.push(format!(
                "publish.destination '{dest}' has no host part for scp"
            ));
        }
        Some(_) => {}
    }
    if settings.url_prefix.is_none() {
        report.warnings.push(
            "publish.url_prefix is not set; the lab will be handed destination paths".into(),
        );
    }
    report
}

fn validate_run(config: &PipelineConfig) -> ValidationReport {
    let mut report = ValidationReport::default();
    let settings = &config.run;
    match &settings.job_template {
        None => report
            .warnings
            .push("run.job_template is not set; run will refuse to submit".into()),
        Some(path) => match std::fs::read_to_string(path) {
            Ok(text) => {
                if let Err(err) = template::render(&text, &TemplateVars::new()) {
                    report
                        .errors
                        .push(format!("run.job_template {}: {err}", path.display()));
                }
            }
            Err(err) => report.errors.push(format!(
                "run.job_template {} cannot be read: {err}",
                path.display()
            )),
        },
    }
    if settings.submit_command.is_empty() {
        report
            .warnings
            .push("run.submit_command is empty; jobs cannot be submitted".into());
    }
    if settings.wait && settings.status_command.is_empty() {
        report
            .errors
            .push("run.wait needs run.status_command to poll the lab".into());
    }
    if settings.poll_interval_secs == 0 {
        report
            .errors
            .push("run.poll_interval_secs must be greater than zero".into());
    }
    if settings.wait && settings.timeout_secs.is_none() {
        report
            .warnings
            .push("run.timeout_secs is not set; waiting for the lab is unbounded".into());
    }
    report
}

fn validate_report(config: &PipelineConfig) -> ValidationReport {
    let mut report = ValidationReport::default();
    let settings = &config.report;
    for pattern in &settings.results {
        if let Err(err) = glob::Pattern::new(pattern) {
            report.errors.push(format!(
                "report.results pattern '{pattern}' is not a valid glob: {err}"
            ));
        }
    }
    if settings.delivery == DeliveryKind::Mail {
        if settings.mail.from.is_none() {
            report
                .errors
                .push("report.mail.from is required for mail delivery".into());
        }
        if settings.mail.to.is_empty() {
            report
                .errors
                .push("report.mail.to needs at least one recipient for mail delivery".into());
        }
        if settings.mail.sendmail.is_empty() {
            report
                .errors
                .push("report.mail.sendmail cannot be empty for mail delivery".into());
        }
        for header in &settings.mail.headers {
            if !header.contains(':') {
                report.errors.push(format!(
                    "report.mail.headers entry '{header}' is not of the form 'Name: value'"
                ));
            }
        }
    }
    report
}

fn validate_bisect(config: &PipelineConfig) -> ValidationReport {
    let mut report = ValidationReport::default();
    let settings = &config.bisect;
    if settings.good_ref.trim().is_empty() {
        report.errors.push("bisect.good_ref cannot be empty".into());
    }
    if settings.bad_ref.as_deref() == Some(settings.good_ref.as_str()) {
        report
            .errors
            .push("bisect.bad_ref must differ from bisect.good_ref".into());
    }
    if settings.pin_host && config.run.host.is_some() {
        report.warnings.push(
            "bisect.pin_host is ignored while run.host already pins every job".into(),
        );
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::default_registry;

    #[test]
    fn empty_config_reports_missing_essentials() {
        let report = validate_config(&PipelineConfig::default(), &default_registry());
        assert!(!report.is_ok());
        assert!(report.errors.iter().any(|e| e.contains("merge.baserepo")));
        assert!(report.errors.iter().any(|e| e.starts_with("build:")));
    }

    #[test]
    fn complete_config_passes() {
        let dir = tempfile::tempdir().unwrap();
        let job = dir.path().join("job.xml");
        std::fs::write(&job, "<job kver=\"##KVER##\" url=\"##KPKG_URL##\"/>").unwrap();

        let mut config = PipelineConfig::default();
        config.merge.baserepo = Some("git://git.kernel.org/linux.git".into());
        config.build.cfgtype = Some("tinyconfig".into());
        config.publish.destination = Some(dir.path().display().to_string());
        config.publish.url_prefix = Some("http://artifacts.example.org".into());
        config.run.job_template = Some(job);
        config.run.submit_command = vec!["lab-submit".into()];

        let report = validate_config(&config, &default_registry());
        assert!(report.is_ok(), "{:?}", report.errors);
    }

    #[test]
    fn unknown_placeholder_in_job_template_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let job = dir.path().join("job.xml");
        std::fs::write(&job, "<job distro=\"##DISTRO##\"/>").unwrap();
        let mut config = PipelineConfig::default();
        config.run.job_template = Some(job);

        let report = validate_run(&config);
        assert!(report.errors.iter().any(|e| e.contains("DISTRO")));
    }
}
