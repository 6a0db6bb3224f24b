use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use log::{debug, info};

use crate::analysis::{Analysis, DurationPoint};
use crate::config::OutputConfig;
use crate::insights::PipelineInsights;

use super::tables::{create_markdown_table, format_minutes, format_pass_rate};

/// Stability rows listed in `report.md`; the CSV files carry the full series
const REPORT_RECENT_BUILDS: usize = 20;

/// `{YYYY-MM-DD}_report` in the working directory.
pub fn default_report_directory(today: NaiveDate) -> PathBuf {
    PathBuf::from(format!("{}_report", today.format("%Y-%m-%d")))
}

/// Writes the report directory for one run and returns the files created.
///
/// The directory is removed and recreated first, so it never mixes the
/// output of two runs. It always holds `report.md` and `insights.json`;
/// per-series CSV files are added unless `multi_plot_only` is set.
pub fn write_report(
    insights: &PipelineInsights,
    dir: &Path,
    config: &OutputConfig,
) -> Result<Vec<PathBuf>> {
    recreate_dir(dir)?;

    let mut files = vec![
        write_file(dir, "report.md", |out| export_markdown(insights, out))?,
        write_file(dir, "insights.json", |out| {
            export_json(insights, config.pretty, out)
        })?,
    ];

    if !config.multi_plot_only {
        let analysis = &insights.analysis;
        files.push(write_file(dir, "stability.csv", |out| {
            export_stability_csv(analysis, out)
        })?);
        files.push(write_file(dir, "build_rate.csv", |out| {
            export_build_rate_csv(analysis, out)
        })?);
        files.push(write_file(dir, "duration.csv", |out| {
            export_duration_csv(&analysis.duration, out)
        })?);
        files.push(write_file(dir, "step_histogram.csv", |out| {
            export_histogram_csv(analysis, out)
        })?);
        for series in &analysis.step_durations {
            let name = format!("step_duration_{}.csv", file_safe(&series.key));
            files.push(write_file(dir, &name, |out| {
                export_duration_csv(&series.points, out)
            })?);
        }
    }

    info!("Wrote {} report files to {}", files.len(), dir.display());
    Ok(files)
}

fn recreate_dir(dir: &Path) -> Result<()> {
    if dir.is_dir() {
        debug!("Removing previous report directory: {}", dir.display());
        fs::remove_dir_all(dir)
            .with_context(|| format!("Failed to remove report directory: {}", dir.display()))?;
    }
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create report directory: {}", dir.display()))
}

fn write_file<F>(dir: &Path, name: &str, export: F) -> Result<PathBuf>
where
    F: FnOnce(&mut dyn Write) -> Result<()>,
{
    let path = dir.join(name);
    let file =
        File::create(&path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    export(&mut writer)?;
    writer
        .flush()
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

/// Step keys may contain characters that are not valid in file names.
fn file_safe(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339()
}

fn optional(value: Option<f64>) -> String {
    value.map_or_else(String::new, |v| format!("{v:.4}"))
}

fn export_json(insights: &PipelineInsights, pretty: bool, output: &mut dyn Write) -> Result<()> {
    let json = if pretty {
        serde_json::to_string_pretty(insights)?
    } else {
        serde_json::to_string(insights)?
    };
    writeln!(output, "{json}")?;
    Ok(())
}

fn export_stability_csv(analysis: &Analysis, output: &mut dyn Write) -> Result<()> {
    writeln!(output, "created_at,build_number,passed,total,pass_rate")?;
    for point in &analysis.stability {
        writeln!(
            output,
            "{},{},{},{},{}",
            timestamp(point.at),
            point.build_number,
            point.passed,
            point.total,
            optional(point.pass_rate)
        )?;
    }
    Ok(())
}

fn export_build_rate_csv(analysis: &Analysis, output: &mut dyn Write) -> Result<()> {
    writeln!(output, "window_center,builds_per_day")?;
    for point in &analysis.build_rate {
        writeln!(
            output,
            "{},{:.4}",
            timestamp(point.at),
            point.builds_per_day
        )?;
    }
    Ok(())
}

fn export_duration_csv(points: &[DurationPoint], output: &mut dyn Write) -> Result<()> {
    writeln!(output, "started_at,seconds,rolling_mean,rolling_median")?;
    for point in points {
        writeln!(
            output,
            "{},{:.1},{:.1},{:.1}",
            timestamp(point.at),
            point.seconds,
            point.rolling_mean,
            point.rolling_median
        )?;
    }
    Ok(())
}

fn export_histogram_csv(analysis: &Analysis, output: &mut dyn Write) -> Result<()> {
    writeln!(output, "step_key,count")?;
    for step in &analysis.step_histogram {
        writeln!(output, "\"{}\",{}", step.key.replace('"', "\"\""), step.count)?;
    }
    Ok(())
}

fn latest_duration_row(label: &str, points: &[DurationPoint]) -> Vec<String> {
    match points.last() {
        Some(latest) => vec![
            label.to_string(),
            points.len().to_string(),
            format_minutes(latest.rolling_mean),
            format_minutes(latest.rolling_median),
        ],
        None => vec![
            label.to_string(),
            "0".to_string(),
            "N/A".to_string(),
            "N/A".to_string(),
        ],
    }
}

#[allow(clippy::too_many_lines)]
fn export_markdown(insights: &PipelineInsights, output: &mut dyn Write) -> Result<()> {
    let analysis = &insights.analysis;

    writeln!(
        output,
        "# Build stability: {}/{}\n",
        insights.organization, insights.pipeline
    )?;
    writeln!(
        output,
        "- Generated: {}",
        insights.collected_at.format("%Y-%m-%d %H:%M UTC")
    )?;
    writeln!(output, "- Cached builds: {}", insights.cached_builds)?;
    writeln!(output, "- Builds analyzed: {}", analysis.analyzed_builds)?;
    writeln!(output, "- Builds passed: {}", analysis.passed_builds)?;
    writeln!(
        output,
        "- Overall pass rate: {}",
        format_pass_rate(analysis.overall_pass_rate)
    )?;
    writeln!(
        output,
        "- Window width: {} days",
        analysis.window_width_days
    )?;
    match &insights.fetch {
        Some(fetch) => writeln!(
            output,
            "- Fetch: {} page(s), {} seen, {} new, {} updated, {} filtered",
            fetch.pages, fetch.seen, fetch.inserted, fetch.updated, fetch.filtered
        )?,
        None => writeln!(output, "- Fetch: skipped, cache was fresh")?,
    }
    writeln!(output)?;

    if analysis.analyzed_builds == 0 {
        writeln!(output, "No finished builds to analyze.")?;
        return Ok(());
    }

    writeln!(output, "## Recent stability\n")?;
    let mut stability = create_markdown_table(&["Build", "Created", "Window builds", "Pass rate"]);
    let skip = analysis.stability.len().saturating_sub(REPORT_RECENT_BUILDS);
    for point in analysis.stability.iter().skip(skip).rev() {
        stability.add_row(vec![
            format!("#{}", point.build_number),
            point.at.format("%Y-%m-%d %H:%M").to_string(),
            point.total.to_string(),
            format_pass_rate(point.pass_rate),
        ]);
    }
    writeln!(output, "{stability}\n")?;

    writeln!(output, "## Rolling durations\n")?;
    let mut durations = create_markdown_table(&["Series", "Samples", "Mean", "Median"]);
    durations.add_row(latest_duration_row("build", &analysis.duration));
    for series in &analysis.step_durations {
        durations.add_row(latest_duration_row(&series.key, &series.points));
    }
    writeln!(output, "{durations}\n")?;

    if let Some(rate) = analysis.build_rate.last() {
        writeln!(
            output,
            "Build rate over the last {} days: {:.1} builds/day\n",
            analysis.window_width_days, rate.builds_per_day
        )?;
    }

    writeln!(output, "## Step executions ({:?} builds)\n", analysis.histogram_mode)?;
    let mut steps = create_markdown_table(&["#", "Step key", "Executions"]);
    for (idx, step) in analysis.step_histogram.iter().enumerate() {
        steps.add_row(vec![
            (idx + 1).to_string(),
            step.key.clone(),
            step.count.to_string(),
        ]);
    }
    writeln!(output, "{steps}")?;

    Ok(())
}
