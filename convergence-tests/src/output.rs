use clap::ValueEnum;
use eyre::Result as EyreResult;
use serde::Serialize;

use crate::report::{Report, RunStatus};
use crate::verifier::Verdict;

/// Human-facing progress on stdout. Structured diagnostics go through
/// `tracing` instead.
#[derive(Clone, Copy, Debug)]
pub struct OutputWriter {
    format: OutputFormat,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum OutputFormat {
    Markdown,
    #[default]
    PlainText,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Status {
    Ok,
    Warn,
    Fail,
    Skip,
}

impl Status {
    const fn marker(self, format: OutputFormat) -> &'static str {
        match (format, self) {
            (OutputFormat::Markdown, Self::Ok) => ":white_check_mark:",
            (OutputFormat::Markdown, Self::Warn) => ":warning:",
            (OutputFormat::Markdown, Self::Fail) => ":x:",
            (OutputFormat::Markdown, Self::Skip) => ":fast_forward:",
            (OutputFormat::PlainText, Self::Ok) => "[ok]",
            (OutputFormat::PlainText, Self::Warn) => "[warn]",
            (OutputFormat::PlainText, Self::Fail) => "[fail]",
            (OutputFormat::PlainText, Self::Skip) => "[skip]",
        }
    }
}

impl From<&Verdict> for Status {
    fn from(verdict: &Verdict) -> Self {
        match verdict {
            Verdict::Pass => Self::Ok,
            Verdict::Fail(_) => Self::Fail,
            Verdict::Skipped { .. } => Self::Skip,
        }
    }
}

impl OutputWriter {
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn write_str(self, line: &str) {
        println!("{}", self.render_line(line));
    }

    pub fn write_header(self, header: &str, level: usize) {
        println!("{}", self.render_header(header, level));
    }

    pub fn write_status(self, status: Status, line: &str) {
        self.write_str(&format!("{} {line}", status.marker(self.format)));
    }

    pub fn write_json<T>(self, json: &T) -> EyreResult<()>
    where
        T: ?Sized + Serialize,
    {
        match self.format {
            OutputFormat::Markdown => {
                println!("```json\n{}\n```", serde_json::to_string_pretty(json)?);
            }
            OutputFormat::PlainText => {
                println!("{}", serde_json::to_string(json)?);
            }
        }

        Ok(())
    }

    /// Prints every verdict with its evidence, then the overall status.
    pub fn write_summary(self, report: &Report) {
        self.write_header("Verdicts", 2);

        for (property, verdict) in &report.run().verdicts {
            self.write_status(Status::from(verdict), &format!("{property}: {verdict}"));

            if let Some(evidence) = verdict.evidence() {
                for mismatch in &evidence.mismatches {
                    self.write_str(&format!("    {mismatch}"));
                }
            }
        }

        for warning in &report.run().warnings {
            self.write_status(Status::Warn, warning);
        }

        if let Some(error) = report.error() {
            self.write_status(Status::Fail, &format!("run aborted: {error}"));
        }

        let status = match report.status() {
            RunStatus::Pass => Status::Ok,
            RunStatus::Fail | RunStatus::Error => Status::Fail,
            RunStatus::Interrupted => Status::Warn,
        };
        self.write_status(
            status,
            &format!(
                "run {} finished: {:?} (exit code {})",
                report.run().run_id,
                report.status(),
                report.status().exit_code()
            ),
        );
    }

    fn render_line(self, line: &str) -> String {
        match self.format {
            OutputFormat::Markdown => format!("{line}  "),
            OutputFormat::PlainText => line.to_owned(),
        }
    }

    fn render_header(self, header: &str, level: usize) -> String {
        match self.format {
            OutputFormat::Markdown => format!("{} {header}  ", "#".repeat(level)),
            OutputFormat::PlainText => {
                let rule = "-".repeat(level * 5);
                format!("{rule}{header}{rule}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_follow_the_format() {
        let markdown = OutputWriter::new(OutputFormat::Markdown);
        let plain = OutputWriter::new(OutputFormat::PlainText);

        assert_eq!(markdown.render_header("Launch", 2), "## Launch  ", "markdown");
        assert_eq!(
            plain.render_header("Launch", 1),
            "-----Launch-----",
            "plain text"
        );
        assert_eq!(markdown.render_line("done"), "done  ", "markdown line break");
    }

    #[test]
    fn verdicts_map_to_markers() {
        let skipped = Verdict::skipped("disabled");

        assert_eq!(Status::from(&Verdict::Pass), Status::Ok, "pass");
        assert_eq!(Status::from(&skipped), Status::Skip, "skipped");
        assert_eq!(
            Status::Fail.marker(OutputFormat::PlainText),
            "[fail]",
            "plain fail marker"
        );
    }
}
