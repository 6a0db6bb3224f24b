use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::{ASCII_MARKDOWN, UTF8_FULL};
use comfy_table::{Cell, Color as TableColor, ContentArrangement, Table};

/// Table and cell creation helpers
pub fn create_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

/// Plain GitHub-flavoured markdown table, never styled.
pub fn create_markdown_table(header: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(ASCII_MARKDOWN)
        .force_no_tty()
        .set_content_arrangement(ContentArrangement::Disabled)
        .set_header(header.to_vec());
    table
}

pub fn format_pass_rate(rate: Option<f64>) -> String {
    rate.map_or_else(|| "N/A".to_string(), |rate| format!("{:.1}%", rate * 100.0))
}

pub fn format_minutes(seconds: f64) -> String {
    format!("{:.1}min", seconds / 60.0)
}

/// Pass rate given as a fraction in `[0, 1]`.
pub fn color_coded_pass_rate_cell(rate: Option<f64>) -> Cell {
    let text = format_pass_rate(rate);
    match rate {
        None => Cell::new(text).fg(TableColor::DarkGrey),
        Some(rate) if rate > 0.8 => Cell::new(text).fg(TableColor::Green),
        Some(rate) if rate >= 0.5 => Cell::new(text).fg(TableColor::Yellow),
        Some(_) => Cell::new(text).fg(TableColor::Red),
    }
}

pub fn color_coded_duration_cell(seconds: f64) -> Cell {
    let minutes = seconds / 60.0;
    let text = format_minutes(seconds);
    if minutes <= 10.0 {
        Cell::new(text).fg(TableColor::Green)
    } else if minutes <= 15.0 {
        Cell::new(text).fg(TableColor::Yellow)
    } else {
        Cell::new(text).fg(TableColor::Red)
    }
}
