//! Oops and call trace detection in serial console logs.

use std::fs;
use std::path::Path;

use regex::Regex;
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::pipeline::StageKind;

/// Lines that open an oops or a call trace.
const TRACE_START: &[&str] = &[
    r"general protection fault:",
    r"BUG:",
    r"kernel BUG at",
    r"do_IRQ: stack overflow:",
    r"RTNL: assertion failed",
    r"Eeek! page_mapcount\(page\) went negative!",
    r"near stack overflow \(cur:",
    r"double fault:",
    r"Badness at",
    r"NETDEV WATCHDOG",
    r"WARNING: at",
    r"appears to be on the same physical disk",
    r"Unable to handle kernel",
    r"sysctl table check failed",
    r"------------\[ cut here \]------------",
    r"list_del corruption\.",
    r"list_add corruption\.",
    r"NMI watchdog: BUG: soft lockup",
    r"irq [0-9]+: nobody cared",
    r"INFO: task .* blocked for more than [0-9]+ seconds",
    r"vmwrite error: reg ",
    r"page allocation failure: order:",
    r"page allocation stalls for.*order:.*mode:",
    r"INFO: rcu_sched self-detected stall on CPU",
    r"INFO: rcu_sched detected stalls on CPUs/tasks:",
    r"NMI watchdog: Watchdog detected hard LOCKUP",
    r"Kernel panic - not syncing: ",
    r"Oops: Unrecoverable TM Unavailable Exception",
    r"\[\s+INFO:.*dependency detected.*\]",
    r"ERR: suspicious RCU usage",
];

/// Lines that belong to a trace already opened. Anything else in between is
/// noise from other writers of the console.
const TRACE_BODY: &[&str] = &[
    r"\[[\d .]+\].*\[[0-9a-f<>]+\]",
    r"\[[\d .]+\]\s+.+\s+[A-Z]\s[0-9a-fx ]+",
    r"\[[\d .]+\]\s+[0-9a-fx ]+",
    r"Instruction dump",
    r"handlers:",
    r"Code: [0-9a-z]+",
    r"blocked for",
    r"Workqueue:",
    r"disables this message",
    r"Call (T|t)race",
    r"Hardware name",
    r"Exception stack",
    r"task: [0-9a-f]+.*task\.",
    r"^(Traceback)?[0-9a-f\s]+$",
    r"(\[[\d .]+\]\s+)?([A-Z0-9]+: [0-9a-fx ]+)+",
    r"Stack:\s*$",
    r"Modules linked in:",
    r"Oops:",
    r"(PGD|EIP)",
    r"pde.*pte",
    r"stack backtrace:",
    r"->.*(lock|mutex)",
    r"shortest dependencies between .*lock",
    r"changed the state of lock",
    r"other info that might help us debug this",
    r"(acquire|holding) lock:",
    r"already depends on the new lock",
    r"existing dependency chain.*:",
    r"RCU used illegally",
    r"rcu_scheduler_active",
];

/// Lines that close a trace.
const TRACE_END: &[&str] = &[
    r"\[ end (trace|Kernel panic)",
    r"\[[\d .]+\]\s+\S{1,4}\s*$",
    r"restraintd",
    r"[0-9a-f]+:[0-9a-f]+:",
    r"beah",
    r"\[-- MARK --",
    r"LTP",
];

/// Lines never looked at.
const IGNORED: &[&str] = &[r"\sOK\s", r"^\s*$"];

struct TracePatterns {
    start: Regex,
    body: Regex,
    end: Regex,
    ignored: Regex,
}

impl TracePatterns {
    fn compile() -> Result<Self> {
        let any = |patterns: &[&str]| {
            Regex::new(&patterns.join("|"))
                .map_err(|err| PipelineError::Config(format!("console pattern: {err}")))
        };
        Ok(Self {
            start: any(TRACE_START)?,
            body: any(TRACE_BODY)?,
            end: any(TRACE_END)?,
            ignored: any(IGNORED)?,
        })
    }
}

/// The part of a console log written by one kernel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsoleLog {
    lines: Vec<String>,
}

impl ConsoleLog {
    /// Keep what follows the `Linux version <release>` banner. A log without
    /// the banner never booted the kernel and yields no lines.
    pub fn parse(kernel_release: &str, text: &str) -> Self {
        let banner = format!("Linux version {kernel_release}");
        let lines = match text.find(&banner) {
            Some(at) => text[at..]
                .lines()
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
            None => Vec::new(),
        };
        Self { lines }
    }

    /// Read a log from an http(s) URL or a local path.
    pub fn fetch(kernel_release: &str, source: &str) -> Result<Self> {
        let text = if source.starts_with("http://") || source.starts_with("https://") {
            debug!(url = source, "Downloading console log");
            reqwest::blocking::get(source)
                .and_then(|response| response.error_for_status())
                .and_then(|response| response.text())
                .map_err(|err| {
                    PipelineError::environment(
                        StageKind::Run,
                        format!("failed to download console log {source}: {err}"),
                    )
                })?
        } else {
            let path = Path::new(source);
            fs::read_to_string(path).map_err(|err| PipelineError::io(path, err))?
        };
        Ok(Self::parse(kernel_release, &text))
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Non-overlapping oopses and call traces, in log order.
    ///
    /// A trace opens on a start line, collects the body lines that follow and
    /// closes on an end line. One that is still open when the log ends is
    /// dropped, as is a start line seen while another trace is open.
    pub fn traces(&self) -> Result<Vec<String>> {
        let patterns = TracePatterns::compile()?;
        let mut traces = Vec::new();
        let mut open: Vec<&str> = Vec::new();

        for line in &self.lines {
            if patterns.ignored.is_match(line) {
                continue;
            }
            if patterns.start.is_match(line) {
                open = vec![line];
            } else if !open.is_empty() {
                if patterns.end.is_match(line) {
                    open.push(line);
                    traces.push(open.join("\n"));
                    open.clear();
                } else if patterns.body.is_match(line) {
                    open.push(line);
                }
            }
        }
        Ok(traces)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RELEASE: &str = "6.1.58-kpatch";

    fn console(body: &str) -> String {
        format!(
            "[    0.000000] Linux version 6.1.0-old (builder@lab)\n\
             [    0.000000] BUG: from the previous kernel\n\
             [    0.000000] Linux version {RELEASE} (builder@lab) #1 SMP\n{body}"
        )
    }

    #[test]
    fn log_starts_at_the_tested_kernel() {
        let log = ConsoleLog::parse(RELEASE, &console("[    1.000000] booted\n\n"));
        assert_eq!(log.lines().len(), 2);
        assert!(log.lines()[0].contains(RELEASE));

        assert!(ConsoleLog::parse("7.0.0", &console("")).lines().is_empty());
    }

    #[test]
    fn oops_is_collected_up_to_its_end_marker() {
        let log = ConsoleLog::parse(
            RELEASE,
            &console(
                "[   12.345678] BUG: unable to handle page fault for address: 0000000000001000\n\
                 [   12.345700] systemd[1]: Started Journal Service.\n\
                 [   12.345800] Call Trace:\n\
                 [   12.345900]  ? do_user_addr_fault+0x1d8/0x680 [ext4]\n\
                 [   12.346000] ---[ end trace 0000000000000000 ]---\n\
                 [   13.000000] Reached target Multi-User System.\n",
            ),
        );
        let traces = log.traces().unwrap();
        assert_eq!(traces.len(), 1);
        let trace = &traces[0];
        assert!(trace.starts_with("[   12.345678] BUG: unable to handle page fault"));
        assert!(trace.contains("Call Trace:"));
        assert!(!trace.contains("Started Journal Service"), "{trace}");
        assert!(trace.ends_with("---[ end trace 0000000000000000 ]---"));
    }

    #[test]
    fn clean_boot_and_unfinished_traces_yield_nothing() {
        let clean = ConsoleLog::parse(
            RELEASE,
            &console("[    2.000000] [  OK  ] Reached target Basic System.\n"),
        );
        assert!(clean.traces().unwrap().is_empty());

        let unfinished = ConsoleLog::parse(
            RELEASE,
            &console("[    5.000000] Kernel panic - not syncing: Fatal exception\n"),
        );
        assert!(unfinished.traces().unwrap().is_empty());
    }

    #[test]
    fn local_files_are_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("console.log");
        fs::write(
            &path,
            console(
                "[    3.000000] WARNING: at mm/slab.c:42 kmem_cache_alloc+0x10/0x20\n\
                 [    3.000100] Modules linked in: ext4\n\
                 [    3.000200] ---[ end trace 1111111111111111 ]---\n",
            ),
        )
        .unwrap();
        let log = ConsoleLog::fetch(RELEASE, &path.to_string_lossy()).unwrap();
        assert_eq!(log.traces().unwrap().len(), 1);
        assert!(ConsoleLog::fetch(RELEASE, "/nonexistent/console.log").is_err());
    }
}
