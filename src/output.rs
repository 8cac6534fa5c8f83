//! Terminal rendering of search results, records and job reports

use crate::import::{ImportStatus, JobState};
use crate::index::Organization;
use crate::query::SearchResults;
use crate::service::Health;
use std::io::{self, Write};
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

fn stdout(color: bool) -> StandardStream {
    StandardStream::stdout(if color { ColorChoice::Auto } else { ColorChoice::Never })
}

/// Render whole dollars with thousands separators
pub fn format_amount(amount: u64) -> String {
    let digits = amount.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    out.push('$');
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

fn location(org: &Organization) -> String {
    match (org.city.is_empty(), org.state.is_empty()) {
        (false, false) => format!("{}, {}", org.city, org.state),
        (false, true) => org.city.clone(),
        (true, false) => org.state.clone(),
        (true, true) => String::new(),
    }
}

/// One line per hit: EIN, name, location, category, revenue
pub fn print_results(results: &SearchResults, color: bool) -> io::Result<()> {
    let mut out = stdout(color);

    for hit in &results.results {
        let org = &hit.organization;
        out.set_color(ColorSpec::new().set_fg(Some(Color::Cyan)))?;
        write!(out, "{}", org.ein)?;
        out.reset()?;
        write!(out, "  ")?;
        out.set_color(ColorSpec::new().set_bold(true))?;
        write!(out, "{}", org.name)?;
        out.reset()?;

        let place = location(org);
        if !place.is_empty() {
            out.set_color(ColorSpec::new().set_fg(Some(Color::Magenta)))?;
            write!(out, "  {}", place)?;
            out.reset()?;
        }
        write!(out, "  [{}]", org.category.code())?;
        if org.revenue > 0 {
            out.set_color(ColorSpec::new().set_fg(Some(Color::Green)))?;
            write!(out, "  {}", format_amount(org.revenue))?;
            out.reset()?;
        }
        if let Some(score) = hit.score {
            write!(out, "  ({:.2})", score)?;
        }
        writeln!(out)?;
    }

    out.set_color(ColorSpec::new().set_dimmed(true))?;
    write!(
        out,
        "{} of {} matches (generation {})",
        results.results.len(),
        results.total_matched,
        results.generation
    )?;
    if let Some(next) = results.next_offset {
        write!(out, "; next page at offset {}", next)?;
    }
    writeln!(out)?;
    out.reset()?;
    Ok(())
}

/// Full field listing of one record
pub fn print_organization(org: &Organization, color: bool) -> io::Result<()> {
    let mut out = stdout(color);

    out.set_color(ColorSpec::new().set_bold(true))?;
    writeln!(out, "{}", org.name)?;
    out.reset()?;

    let values = org.column_values();
    for (column, value) in Organization::COLUMNS.iter().zip(values.iter()) {
        if value.is_empty() || *column == "name" {
            continue;
        }
        out.set_color(ColorSpec::new().set_fg(Some(Color::Cyan)))?;
        write!(out, "{:<18}", column)?;
        out.reset()?;
        match *column {
            "revenue" | "income" | "assets" => {
                let amount = value.parse::<u64>().unwrap_or(0);
                writeln!(out, "{}", format_amount(amount))?
            }
            "category" => writeln!(out, "{} ({})", value, org.category.description())?,
            _ => writeln!(out, "{}", value)?,
        }
    }
    Ok(())
}

fn state_color(state: JobState) -> Color {
    match state {
        JobState::Completed => Color::Green,
        JobState::Failed => Color::Red,
        JobState::Idle => Color::White,
        _ => Color::Yellow,
    }
}

pub fn print_import_status(status: &ImportStatus, color: bool) -> io::Result<()> {
    let mut out = stdout(color);

    writeln!(out, "Job:          {}", status.job_id)?;
    write!(out, "State:        ")?;
    out.set_color(ColorSpec::new().set_fg(Some(state_color(status.state))).set_bold(true))?;
    write!(out, "{}", status.state)?;
    out.reset()?;
    if status.degraded {
        out.set_color(ColorSpec::new().set_fg(Some(Color::Yellow)))?;
        write!(out, " (degraded)")?;
        out.reset()?;
    }
    writeln!(out)?;
    writeln!(out, "Started:      {}", status.started_at.format("%Y-%m-%d %H:%M:%S UTC"))?;
    if let Some(finished) = status.finished_at {
        writeln!(out, "Finished:     {}", finished.format("%Y-%m-%d %H:%M:%S UTC"))?;
    }
    writeln!(out, "Rows read:    {}", status.rows_read)?;
    writeln!(
        out,
        "Rejected:     {} ({:.2}%)",
        status.rows_rejected,
        status.reject_ratio * 100.0
    )?;
    for (reason, count) in &status.rejections {
        writeln!(out, "  {:<20} {}", reason, count)?;
    }
    if status.rows_coerced > 0 {
        writeln!(out, "Coerced:      {}", status.rows_coerced)?;
    }
    if let Some(orgs) = status.organizations {
        writeln!(out, "Organizations: {}", orgs)?;
    }
    if let Some(generation) = status.generation {
        writeln!(out, "Generation:   {}", generation)?;
    }
    if let Some(error) = &status.error {
        out.set_color(ColorSpec::new().set_fg(Some(Color::Red)))?;
        writeln!(out, "Error:        {}", error)?;
        out.reset()?;
    }
    Ok(())
}

pub fn print_health(health: &Health) {
    println!("Active generation: {}", health.active_generation);
    println!("Organizations:     {}", health.organizations);
    match health.last_import_completed_at {
        Some(at) => println!("Last import:       {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
        None => println!("Last import:       never"),
    }
    if let Some(state) = health.import_state {
        println!("Import job:        {}", state);
    }
}
