//! CLI output formatting.
//!
//! Each stage is one line: positional index, stage name, transform, file
//! count, size change, time. Extra detail from the transform (cache
//! statistics, skipped drafts) follows as an indented context line.
//!
//! # Output Format
//!
//! ## Run
//!
//! ```text
//! 01/11 clean            reset      0 files                    0.00s
//!     reset _site
//! 02/11 compile-markup   markup     2 files   1.2 KB → 4.8 KB  0.01s
//! ...
//! 11/11 minify-html      minify-html 2 files   6.1 KB → 4.9 KB  0.00s
//!
//! ==> build (dist) finished: 11 stages, 12 files written in 0.31s
//!     Digest: 5f0c…
//! ```
//!
//! ## Check
//!
//! ```text
//! build (dist)
//! 01 clean           reset distribution:/
//! 02 compile-markup  markup
//!     read  source:/ **/*.{html,md,mkd,markdown}
//!     write distribution:/ **/*.html
//! ...
//! 08 minify-styles   minify-css
//!     read  distribution:/css blog.css (once prefixed)
//!     write distribution:/css blog.css [minified]
//! ```
//!
//! # Architecture
//!
//! Every `format_*` function returns `Vec<String>` and has no side effects;
//! the `print_*` wrappers write to stdout.

use crate::pipeline::{Action, Pipeline, PipelineReport, StageEvent, StageReport};
use crate::watch::WatchRule;
use std::time::Duration;

// ============================================================================
// Shared helpers
// ============================================================================

/// `i/total` with the index padded to the width of `total`.
fn format_position(index: usize, total: usize) -> String {
    let width = total.to_string().len().max(2);
    format!("{:0>width$}/{:0>width$}", index, total, width = width)
}

fn indent(depth: usize) -> String {
    "    ".repeat(depth)
}

/// Human-readable byte count.
fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    let b = bytes as f64;
    if b < KB {
        format!("{} B", bytes)
    } else if b < KB * KB {
        format!("{:.1} KB", b / KB)
    } else {
        format!("{:.1} MB", b / (KB * KB))
    }
}

fn format_duration(elapsed: Duration) -> String {
    format!("{:.2}s", elapsed.as_secs_f64())
}

fn plural(n: usize, word: &str) -> String {
    if n == 1 {
        format!("{} {}", n, word)
    } else {
        format!("{} {}s", n, word)
    }
}

fn stage_line(index: usize, total: usize, report: &StageReport) -> Vec<String> {
    let outcome = &report.outcome;
    let sizes = if outcome.bytes_in == 0 && outcome.bytes_out == 0 {
        String::new()
    } else {
        format!(
            "{} → {}",
            format_bytes(outcome.bytes_in),
            format_bytes(outcome.bytes_out)
        )
    };
    let mut lines = vec![format!(
        "{} {:<16} {:<16} {:<9} {:<22} {}",
        format_position(index, total),
        report.name,
        report.transform,
        plural(outcome.written.len(), "file"),
        sizes,
        format_duration(report.elapsed)
    )];
    if let Some(note) = &outcome.note {
        lines.push(format!("{}{}", indent(1), note));
    }
    lines
}

// ============================================================================
// Run output
// ============================================================================

/// Format one progress event. Start events print nothing; the finished line
/// carries everything.
pub fn format_stage_event(event: &StageEvent) -> Vec<String> {
    match event {
        StageEvent::Started { .. } => Vec::new(),
        StageEvent::Finished {
            index,
            total,
            report,
        } => stage_line(*index, *total, report),
        StageEvent::Failed { stage, message } => {
            vec![format!("FAILED {}", stage), format!("{}{}", indent(1), message)]
        }
    }
}

pub fn print_stage_event(event: &StageEvent) {
    for line in format_stage_event(event) {
        println!("{}", line);
    }
}

/// Summary after a complete run, with the output tree digest when known.
pub fn format_pipeline_report(report: &PipelineReport, digest: Option<&str>) -> Vec<String> {
    let written: usize = report.stages.iter().map(|s| s.outcome.written.len()).sum();
    let mut lines = vec![
        String::new(),
        format!(
            "==> {} ({}) finished: {}, {} written in {}",
            report.pipeline,
            report.mode,
            plural(report.stages.len(), "stage"),
            plural(written, "file"),
            format_duration(report.elapsed)
        ),
    ];
    if let Some(digest) = digest {
        lines.push(format!("{}Digest: {}", indent(1), digest));
    }
    lines
}

pub fn print_pipeline_report(report: &PipelineReport, digest: Option<&str>) {
    for line in format_pipeline_report(report, digest) {
        println!("{}", line);
    }
}

// ============================================================================
// Check output
// ============================================================================

/// Describe a pipeline's stages and, for the dev pipeline, its watch rules.
pub fn format_check_output(pipeline: &Pipeline, rules: &[WatchRule]) -> Vec<String> {
    let mut lines = vec![format!("{} ({})", pipeline.name, pipeline.mode)];
    let width = pipeline
        .stages
        .iter()
        .map(|s| s.name.len())
        .max()
        .unwrap_or(0);
    for (i, stage) in pipeline.stages.iter().enumerate() {
        let position = format!("{:0>2}", i + 1);
        match &stage.action {
            Action::Reset(_) => lines.push(format!(
                "{} {:<width$}  reset {}",
                position,
                stage.name,
                stage.output,
                width = width
            )),
            Action::Invoke { transform, .. } => {
                lines.push(format!(
                    "{} {:<width$}  {}",
                    position,
                    stage.name,
                    transform,
                    width = width
                ));
                for input in &stage.inputs {
                    let mut line = format!(
                        "{}read  {} {}",
                        indent(1),
                        input.location,
                        input.patterns.join(" ")
                    );
                    if !input.requires.is_empty() {
                        line.push_str(&format!(" (once {})", input.requires.join(", ")));
                    }
                    lines.push(line);
                }
                let mut line = format!(
                    "{}write {} {}",
                    indent(1),
                    stage.output,
                    stage.produces.join(" ")
                );
                if !stage.marks.is_empty() {
                    line.push_str(&format!(" [{}]", stage.marks.join(", ")));
                }
                lines.push(line);
            }
        }
    }
    if !rules.is_empty() {
        lines.push(String::new());
        lines.push("Watch".to_string());
        for rule in rules {
            let stages = if rule.stages.is_empty() {
                "reload only".to_string()
            } else {
                rule.stages.join(", ")
            };
            lines.push(format!("{}{} → {}", indent(1), rule.globs.join(" "), stages));
        }
    }
    lines
}

pub fn print_check_output(pipeline: &Pipeline, rules: &[WatchRule]) {
    for line in format_check_output(pipeline, rules) {
        println!("{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::flow::Mode;
    use crate::registry::Outcome;
    use std::path::PathBuf;

    fn report(name: &str, written: usize, note: Option<&str>) -> StageReport {
        StageReport {
            name: name.into(),
            transform: "minify-css".into(),
            outcome: Outcome {
                written: (0..written).map(|i| PathBuf::from(format!("{i}.css"))).collect(),
                bytes_in: 2048,
                bytes_out: 1536,
                note: note.map(str::to_string),
            },
            elapsed: Duration::from_millis(20),
        }
    }

    #[test]
    fn format_position_pads_to_total() {
        assert_eq!(format_position(3, 11), "03/11");
        assert_eq!(format_position(7, 120), "007/120");
    }

    #[test]
    fn format_bytes_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn plural_forms() {
        assert_eq!(plural(1, "file"), "1 file");
        assert_eq!(plural(0, "file"), "0 files");
    }

    #[test]
    fn started_event_is_silent() {
        let event = StageEvent::Started {
            index: 1,
            total: 4,
            stage: "clean".into(),
        };
        assert!(format_stage_event(&event).is_empty());
    }

    #[test]
    fn finished_event_shows_sizes_and_note() {
        let event = StageEvent::Finished {
            index: 8,
            total: 11,
            report: report("minify-styles", 1, Some("3 cached, 1 optimized (4 total)")),
        };
        let lines = format_stage_event(&event);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("08/11 minify-styles"));
        assert!(lines[0].contains("1 file "));
        assert!(lines[0].contains("2.0 KB → 1.5 KB"));
        assert!(lines[0].ends_with("0.02s"));
        assert_eq!(lines[1], "    3 cached, 1 optimized (4 total)");
    }

    #[test]
    fn failed_event_names_stage() {
        let event = StageEvent::Failed {
            stage: "concat-styles".into(),
            message: "missing input file: poole.css".into(),
        };
        assert_eq!(
            format_stage_event(&event),
            vec!["FAILED concat-styles", "    missing input file: poole.css"]
        );
    }

    #[test]
    fn pipeline_report_summary() {
        let report = PipelineReport {
            pipeline: "build".into(),
            mode: Mode::Dist,
            stages: vec![report("a", 2, None), report("b", 1, None)],
            elapsed: Duration::from_millis(310),
        };
        let lines = format_pipeline_report(&report, Some("abc123"));
        assert_eq!(
            lines,
            vec![
                String::new(),
                "==> build (dist) finished: 2 stages, 3 files written in 0.31s".to_string(),
                "    Digest: abc123".to_string(),
            ]
        );
    }

    #[test]
    fn check_output_lists_stages_and_rules() {
        let config = PipelineConfig::default();
        let pipeline = crate::pipeline::dev_pipeline(&config);
        let rules = crate::watch::dev_watch_rules(&config);
        let lines = format_check_output(&pipeline, &rules);

        assert_eq!(lines[0], "serve (dev)");
        assert!(lines[1].starts_with("01 clean"));
        assert!(lines[1].ends_with("reset intermediate:/"));
        assert!(lines.contains(&"    write intermediate:/css blog.css".to_string()));
        assert!(lines.contains(&"    write intermediate:/css blog.css [prefixed]".to_string()));
        assert!(lines.contains(&"    read  source:/_assets/js **/*.js".to_string()));
        assert!(lines.contains(&"    _assets/css/**/*.css → concat-styles, prefix-styles".to_string()));
        assert!(
            lines
                .iter()
                .any(|l| l.starts_with("    _assets/img/") && l.ends_with("reload only"))
        );
    }

    #[test]
    fn check_output_shows_required_marks() {
        let pipeline = crate::pipeline::dist_pipeline(&PipelineConfig::default(), None, true);
        let lines = format_check_output(&pipeline, &[]);
        assert!(lines.contains(
            &"    read  distribution:/ **/*.html (once critical-inlined)".to_string()
        ));
        assert!(lines.contains(&"    write distribution:/ **/*.html [minified]".to_string()));
    }
}
