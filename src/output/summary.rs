use std::fmt::Write;

use crate::insights::PipelineInsights;
use comfy_table::{Cell, Color as TableColor};

use super::styling::{bright, bright_green, bright_red, bright_yellow, cyan, dim};
use super::tables::{
    color_coded_duration_cell, color_coded_pass_rate_cell, create_table, format_pass_rate,
};

/// Builds shown in the recent stability table
const RECENT_BUILDS: usize = 10;

/// Prints a human-readable summary of the pipeline's stability to stdout.
///
/// Displays color-coded tables showing:
/// - Overview: pipeline, cache size, overall pass rate, fetch statistics
/// - Recent Stability: windowed pass rate of the latest builds
/// - Durations: latest rolling mean/median for builds and selected steps
/// - Top Steps: the `top_n` most executed step keys
///
/// Color coding:
/// - Green: pass rate >80%, durations ≤10min
/// - Yellow: pass rate 50-80%, durations 10-15min
/// - Red: pass rate <50%, durations >15min
pub fn print_summary(insights: &PipelineInsights, top_n: usize) {
    println!("{}", render_summary(insights, top_n));
}

fn create_cyan_header(labels: &[&str]) -> Vec<Cell> {
    labels
        .iter()
        .map(|label| Cell::new(*label).fg(TableColor::Cyan))
        .collect()
}

fn add_section_header(output: &mut String, emoji: &str, title: &str) {
    let _ = writeln!(output, "{} {}", bright(emoji), bright(title).underlined());
}

#[allow(clippy::too_many_lines, clippy::format_push_string)]
fn render_summary(insights: &PipelineInsights, top_n: usize) -> String {
    let mut output = String::new();
    let analysis = &insights.analysis;

    add_section_header(&mut output, "📊", "Overview");

    let pass_rate_display = match analysis.overall_pass_rate {
        Some(rate) if rate > 0.8 => bright_green(format_pass_rate(Some(rate))),
        Some(rate) if rate >= 0.5 => bright_yellow(format_pass_rate(Some(rate))),
        rate => bright_red(format_pass_rate(rate)),
    };

    let fetch_display = insights.fetch.as_ref().map_or_else(
        || dim("skipped (cache is fresh)"),
        |fetch| {
            dim(format!(
                "{} page(s), {} new, {} updated, {} filtered",
                fetch.pages, fetch.inserted, fetch.updated, fetch.filtered
            ))
        },
    );

    output.push_str(&format!(
        "  {} {}\n  {} {}\n  {} {}\n  {} {}\n  {} {}\n  {} {}\n  {} {}\n\n",
        dim("Pipeline:"),
        cyan(format!("{}/{}", insights.organization, insights.pipeline)),
        dim("Cached builds:"),
        bright_yellow(insights.cached_builds),
        dim("Builds analyzed:"),
        bright_yellow(analysis.analyzed_builds),
        dim("Overall pass rate:"),
        pass_rate_display,
        dim("Window width:"),
        bright_yellow(format!("{} days", analysis.window_width_days)),
        dim("Fetch:"),
        fetch_display,
        dim("Analysis date:"),
        dim(insights.collected_at.format("%Y-%m-%d %H:%M UTC"))
    ));

    if analysis.analyzed_builds == 0 {
        output.push_str(&format!(
            "{}\n",
            bright_yellow("No finished builds to analyze.")
        ));
        return output;
    }

    // Recent Stability
    add_section_header(&mut output, "📈", "Recent Stability");

    let mut stability_table = create_table();
    stability_table.set_header(create_cyan_header(&[
        "Build",
        "Created",
        "Window Builds",
        "Pass Rate",
    ]));

    let skip = analysis.stability.len().saturating_sub(RECENT_BUILDS);
    for point in analysis.stability.iter().skip(skip).rev() {
        stability_table.add_row(vec![
            Cell::new(format!("#{}", point.build_number)),
            Cell::new(point.at.format("%Y-%m-%d %H:%M")),
            Cell::new(point.total),
            color_coded_pass_rate_cell(point.pass_rate),
        ]);
    }

    output.push_str(&format!("{stability_table}\n\n"));

    // Durations
    add_section_header(&mut output, "⏱️", "Rolling Durations");

    let mut duration_table = create_table();
    duration_table.set_header(create_cyan_header(&["Series", "Samples", "Mean", "Median"]));

    let series = std::iter::once(("build", analysis.duration.as_slice())).chain(
        analysis
            .step_durations
            .iter()
            .map(|s| (s.key.as_str(), s.points.as_slice())),
    );
    for (label, points) in series {
        match points.last() {
            Some(latest) => duration_table.add_row(vec![
                Cell::new(label),
                Cell::new(points.len()),
                color_coded_duration_cell(latest.rolling_mean),
                color_coded_duration_cell(latest.rolling_median),
            ]),
            None => duration_table.add_row(vec![
                Cell::new(label),
                Cell::new(0),
                Cell::new("N/A").fg(TableColor::DarkGrey),
                Cell::new("N/A").fg(TableColor::DarkGrey),
            ]),
        };
    }

    output.push_str(&format!("{duration_table}\n"));
    if let Some(rate) = analysis.build_rate.last() {
        output.push_str(&format!(
            "  {} {}\n",
            dim("Build rate:"),
            bright_yellow(format!("{:.1} builds/day", rate.builds_per_day))
        ));
    }
    output.push('\n');

    // Top Steps
    add_section_header(&mut output, "🔁", &format!("Top {top_n} Steps"));

    let mut steps_table = create_table();
    steps_table.set_header(create_cyan_header(&["#", "Step Key", "Executions"]));

    for (idx, step) in analysis.step_histogram.iter().take(top_n).enumerate() {
        steps_table.add_row(vec![
            Cell::new(idx + 1),
            Cell::new(&step.key),
            Cell::new(step.count),
        ]);
    }

    if analysis.step_histogram.len() > top_n {
        steps_table.add_row(vec![
            Cell::new(""),
            Cell::new(format!(
                "... and {} more",
                analysis.step_histogram.len() - top_n
            ))
            .fg(TableColor::DarkGrey),
            Cell::new(""),
        ]);
    }

    output.push_str(&format!("{steps_table}\n\n"));

    add_section_header(&mut output, "💡", "Next Steps");
    output.push_str(&format!(
        "  {} Open {} in the report directory for the full series\n\
         \x20 {} Use {} to track the duration of individual steps\n",
        cyan("•"),
        bright_yellow("report.md"),
        cyan("•"),
        bright_yellow("--multi-plot-add-step-duration"),
    ));

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{Analysis, DurationPoint, StabilityPoint, StepCount};
    use crate::config::AnalysisConfig;
    use crate::insights::FetchInsights;
    use chrono::{Duration, TimeZone, Utc};

    fn create_insights(analysis: Analysis) -> PipelineInsights {
        PipelineInsights {
            provider: "Buildkite".to_string(),
            organization: "acme".to_string(),
            pipeline: "web".to_string(),
            collected_at: Utc::now(),
            cached_builds: 42,
            fetch: Some(FetchInsights {
                pages: 2,
                seen: 150,
                filtered: 3,
                inserted: 12,
                updated: 1,
                unchanged: 134,
            }),
            analysis,
        }
    }

    fn create_analysis(builds: u64, steps: usize) -> Analysis {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let mut analysis = Analysis::empty(&AnalysisConfig::default());
        analysis.analyzed_builds = usize::try_from(builds).unwrap();
        analysis.passed_builds = analysis.analyzed_builds;
        analysis.overall_pass_rate = Some(0.9);
        analysis.stability = (1..=builds)
            .map(|number| StabilityPoint {
                at: start + Duration::hours(i64::try_from(number).unwrap()),
                build_number: number,
                passed: 9,
                total: 10,
                pass_rate: Some(0.9),
            })
            .collect();
        analysis.duration = vec![DurationPoint {
            at: start,
            seconds: 600.0,
            rolling_mean: 720.0,
            rolling_median: 660.0,
        }];
        analysis.step_histogram = (0..steps)
            .map(|i| StepCount {
                key: format!("step-{i:02}"),
                count: 100 - i,
            })
            .collect();
        analysis
    }

    #[test]
    fn test_render_summary_without_builds() {
        let insights = create_insights(Analysis::empty(&AnalysisConfig::default()));

        let output = render_summary(&insights, 7);

        assert!(output.contains("acme/web"));
        assert!(output.contains("Builds analyzed:"));
        assert!(output.contains("N/A"));
        assert!(output.contains("No finished builds to analyze"));
        assert!(!output.contains("Recent Stability"));
    }

    #[test]
    fn test_render_summary_with_builds() {
        let insights = create_insights(create_analysis(25, 3));

        let output = render_summary(&insights, 7);

        assert!(output.contains("90.0%"));
        assert!(output.contains("2 page(s), 12 new, 1 updated, 3 filtered"));
        assert!(output.contains("Recent Stability"));
        // Only the latest builds are listed
        assert!(output.contains("#25"));
        assert!(output.contains("#16"));
        assert!(!output.contains("#15"));
        assert!(output.contains("12.0min"));
        assert!(output.contains("11.0min"));
        assert!(output.contains("step-02"));
        assert!(!output.contains("more"));
    }

    #[test]
    fn test_render_summary_limits_top_steps() {
        let insights = create_insights(create_analysis(3, 12));

        let output = render_summary(&insights, 5);

        assert!(output.contains("Top 5 Steps"));
        assert!(output.contains("step-04"));
        assert!(!output.contains("step-05"));
        assert!(output.contains("... and 7 more"));
    }

    #[test]
    fn test_render_summary_skipped_fetch() {
        let mut insights = create_insights(create_analysis(3, 1));
        insights.fetch = None;

        let output = render_summary(&insights, 7);

        assert!(output.contains("skipped (cache is fresh)"));
    }
}
