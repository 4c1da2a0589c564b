use std::io::{self, Write};

use tracing::info;

use super::Delivery;
use super::process::Invocation;
use crate::config::{DeliveryKind, MailSettings, ReportSettings};
use crate::error::{PipelineError, Result};
use crate::pipeline::StageKind;
use crate::report::RenderedReport;

pub const JOBS_HEADER: &str = "X-Kpatch-Jobs";

/// Prints the report or pipes it to a sendmail-compatible command.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReportDelivery;

impl Delivery for ReportDelivery {
    fn deliver(&mut self, report: &RenderedReport, channel: &ReportSettings) -> Result<()> {
        match channel.delivery {
            DeliveryKind::Stdout => {
                let mut stdout = io::stdout().lock();
                write!(stdout, "Subject: {}\n\n{}", report.subject, report.body)
                    .and_then(|_| stdout.flush())
                    .map_err(|err| PipelineError::io("<stdout>", err))
            }
            DeliveryKind::Mail => {
                let message = compose_mail(report, &channel.mail)?;
                let output = Invocation::from_argv(StageKind::Report, &channel.mail.sendmail)?
                    .stdin(message)
                    .run()?;
                if !output.succeeded() {
                    return Err(PipelineError::environment(
                        StageKind::Report,
                        format!("sendmail failed: {}", output.describe_failure()),
                    ));
                }
                info!(to = ?channel.mail.to, subject = %report.subject, "Report mailed");
                Ok(())
            }
        }
    }
}

/// An RFC 5322 message for `sendmail -t`.
pub fn compose_mail(report: &RenderedReport, mail: &MailSettings) -> Result<String> {
    let from = mail
        .from
        .as_deref()
        .ok_or_else(|| PipelineError::Config("mail delivery needs report.mail.from".into()))?;
    if mail.to.is_empty() {
        return Err(PipelineError::Config(
            "mail delivery needs at least one report.mail.to recipient".into(),
        ));
    }

    let mut subject = mail
        .subject
        .clone()
        .unwrap_or_else(|| report.subject.clone());
    if let Some(prefix) = &mail.subject_prefix {
        subject = format!("{prefix}{subject}");
    }

    let mut headers = vec![
        format!("From: {from}"),
        format!("To: {}", join_addresses(&mail.to)),
    ];
    if !mail.cc.is_empty() {
        headers.push(format!("Cc: {}", join_addresses(&mail.cc)));
    }
    if !mail.bcc.is_empty() {
        headers.push(format!("Bcc: {}", join_addresses(&mail.bcc)));
    }
    headers.push(format!("Subject: {subject}"));
    headers.push(format!("{JOBS_HEADER}: {}", report.job_ids.join(" ")));
    headers.push("MIME-Version: 1.0".into());
    headers.push("Content-Type: text/plain; charset=utf-8".into());
    for line in &mail.headers {
        let (name, value) = line.split_once(':').ok_or_else(|| {
            PipelineError::Config(format!("mail header '{line}' is not of the form Name: value"))
        })?;
        headers.push(format!("{}: {}", name.trim(), value.trim()));
    }

    Ok(format!("{}\n\n{}", headers.join("\n"), report.body))
}

fn join_addresses(addresses: &[String]) -> String {
    addresses
        .iter()
        .map(|a| a.trim())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::ReportStatus;

    fn report() -> RenderedReport {
        RenderedReport {
            subject: "PASS: Test report for kernel 6.6.0 (linux)".into(),
            body: "All good.\n".into(),
            status: ReportStatus::Pass,
            job_ids: vec!["J:1".into(), "J:2".into()],
        }
    }

    #[test]
    fn mail_carries_headers_and_job_ids() {
        let mail = MailSettings {
            from: Some("ci@example.org".into()),
            to: vec!["dev@example.org".into(), " list@example.org ".into()],
            bcc: vec!["audit@example.org".into()],
            subject_prefix: Some("[kpatch] ".into()),
            headers: vec!["In-Reply-To: <abc@example.org>".into()],
            ..MailSettings::default()
        };
        let message = compose_mail(&report(), &mail).unwrap();
        assert!(message.contains("To: dev@example.org, list@example.org\n"));
        assert!(message.contains("Bcc: audit@example.org\n"));
        assert!(message.contains("Subject: [kpatch] PASS: Test report for kernel 6.6.0 (linux)\n"));
        assert!(message.contains("X-Kpatch-Jobs: J:1 J:2\n"));
        assert!(message.contains("In-Reply-To: <abc@example.org>\n"));
        assert!(message.ends_with("\n\nAll good.\n"));
        assert!(!message.contains("Cc:"));
    }

    #[test]
    fn subject_override_replaces_generated_subject() {
        let mail = MailSettings {
            from: Some("ci@example.org".into()),
            to: vec!["dev@example.org".into()],
            subject: Some("Nightly".into()),
            ..MailSettings::default()
        };
        let message = compose_mail(&report(), &mail).unwrap();
        assert!(message.contains("Subject: Nightly\n"));
    }

    #[test]
    fn mail_requires_sender_and_recipient() {
        assert!(compose_mail(&report(), &MailSettings::default()).is_err());
    }
}
